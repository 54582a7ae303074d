use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    db::with_transaction,
    entities::{
        attendee::{self, Entity as Attendee},
        purchase::{self, Entity as Purchase, PaymentMethod, PaymentStatus, PurchaseStatus},
        purchase_item::{self, Entity as PurchaseItem},
        purchaser::{self, Entity as Purchaser},
    },
    errors::{FieldErrors, ServiceError},
    events::{Event, EventSender},
    services::{
        checkout::session::{AttendeeInput, TicketSelection},
        currency::round_money,
        promotions::{CandidateSelection, DiscountResult, PromotionService},
    },
};

/// Order amounts in the canonical currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub tax_amount: Decimal,
    pub final_amount: Decimal,
}

impl PriceBreakdown {
    /// Tax applies to the discounted subtotal. The final amount never goes
    /// below zero.
    pub fn compute(subtotal: Decimal, discount: Decimal, tax_rate: Decimal) -> Self {
        let subtotal = round_money(subtotal);
        let discount_amount = round_money(discount.max(Decimal::ZERO).min(subtotal));
        let taxable = (subtotal - discount_amount).max(Decimal::ZERO);
        let tax_amount = round_money(taxable * tax_rate);
        let final_amount = round_money((subtotal - discount_amount + tax_amount).max(Decimal::ZERO));

        Self {
            subtotal,
            discount_amount,
            tax_amount,
            final_amount,
        }
    }
}

/// Purchaser fields captured across the contact and attendee steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaserInfo {
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub organization: Option<String>,
    pub country: String,
    pub is_attending: bool,
    pub terms_accepted: bool,
    pub updates_consent: bool,
}

#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub purchaser: PurchaserInfo,
    pub selection: TicketSelection,
    pub attendees: Vec<AttendeeInput>,
    pub payment_method: PaymentMethod,
    pub invoice_reference: Option<String>,
    pub promo_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseResult {
    pub purchase: purchase::Model,
    pub purchaser: purchaser::Model,
    pub items: Vec<purchase_item::Model>,
    pub attendees: Vec<attendee::Model>,
    pub discount: Option<DiscountResult>,
}

/// A stored purchase with everything it owns.
#[derive(Debug, Clone, Serialize)]
pub struct PurchaseDetails {
    pub purchase: purchase::Model,
    pub purchaser: purchaser::Model,
    pub items: Vec<purchase_item::Model>,
    pub attendees: Vec<attendee::Model>,
}

#[derive(Debug, Clone)]
pub struct PricingSettings {
    pub tax_rate: Decimal,
    pub currency: String,
    pub event_id: String,
}

impl PricingSettings {
    pub fn from_config(config: &crate::config::AppConfig) -> Self {
        Self {
            tax_rate: config.tax_rate,
            currency: config.canonical_currency.clone(),
            event_id: config.event_id.clone(),
        }
    }
}

#[derive(Clone)]
pub struct PurchaseService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    settings: PricingSettings,
}

impl PurchaseService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        settings: PricingSettings,
    ) -> Self {
        Self {
            db,
            event_sender,
            settings,
        }
    }

    pub fn candidate_for(&self, selection: &TicketSelection) -> CandidateSelection {
        CandidateSelection {
            ticket_types: selection.ticket_types(),
            event_id: Some(self.settings.event_id.clone()),
            total: selection.subtotal(),
        }
    }

    fn check_request(request: &PurchaseRequest) -> Result<(), ServiceError> {
        let mut errors = FieldErrors::new();

        if request.selection.lines.is_empty() {
            errors.add("tickets", "Select at least one ticket");
        }
        if request.attendees.len() != request.selection.total_quantity() {
            errors.add(
                "attendees",
                format!(
                    "Enter details for exactly {} attendees",
                    request.selection.total_quantity()
                ),
            );
        }
        if !request.purchaser.terms_accepted {
            errors.add("terms_accepted", "You must accept the terms to continue");
        }
        if request.payment_method == PaymentMethod::BankTransfer
            && request
                .invoice_reference
                .as_deref()
                .map_or(true, |r| r.trim().is_empty())
        {
            errors.add("invoice_reference", "Bank transfers need an invoice reference");
        }

        errors.into_result()
    }

    /// Records purchaser, order, line items and attendees as one unit.
    ///
    /// The promo code is validated (not consumed) inside the same transaction.
    /// Any failure leaves no rows behind.
    #[instrument(skip(self, request), fields(email = %request.purchaser.email))]
    pub async fn complete_purchase(
        &self,
        request: PurchaseRequest,
    ) -> Result<PurchaseResult, ServiceError> {
        Self::check_request(&request)?;

        let candidate = self.candidate_for(&request.selection);
        let settings = self.settings.clone();

        let result = with_transaction(&*self.db, move |txn| {
            Box::pin(async move { insert_purchase(txn, request, candidate, settings).await })
        })
        .await?;

        info!(
            purchase_id = %result.purchase.id,
            final_amount = %result.purchase.final_amount,
            "purchase recorded"
        );

        self.event_sender
            .send_or_log(Event::PurchaseCreated {
                purchase_id: result.purchase.id,
                final_amount: result.purchase.final_amount,
                attendee_count: result.attendees.len(),
            })
            .await;

        Ok(result)
    }

    pub async fn find_purchase(&self, purchase_id: Uuid) -> Result<purchase::Model, ServiceError> {
        find_purchase_on(&*self.db, purchase_id).await
    }

    pub async fn purchase_details(&self, purchase_id: Uuid) -> Result<PurchaseDetails, ServiceError> {
        load_details(&*self.db, purchase_id).await
    }
}

async fn insert_purchase<C: ConnectionTrait>(
    txn: &C,
    request: PurchaseRequest,
    candidate: CandidateSelection,
    settings: PricingSettings,
) -> Result<PurchaseResult, ServiceError> {
    let now = Utc::now();
    let PurchaseRequest {
        purchaser: info,
        selection,
        attendees,
        payment_method,
        invoice_reference,
        promo_code,
    } = request;

    let purchaser = purchaser::ActiveModel {
        id: Set(Uuid::new_v4()),
        full_name: Set(info.full_name.trim().to_string()),
        email: Set(info.email.trim().to_lowercase()),
        phone: Set(info.phone.trim().to_string()),
        organization: Set(info.organization.clone()),
        country: Set(info.country.trim().to_string()),
        is_attending: Set(info.is_attending),
        terms_accepted: Set(info.terms_accepted),
        updates_consent: Set(info.updates_consent),
        created_at: Set(now),
    }
    .insert(txn)
    .await?;

    let discount = match promo_code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => {
            Some(PromotionService::validate_on(txn, code, &candidate, now).await?)
        }
        _ => None,
    };

    let totals = PriceBreakdown::compute(
        selection.subtotal(),
        discount.as_ref().map_or(Decimal::ZERO, |d| d.amount),
        settings.tax_rate,
    );

    let purchase = purchase::ActiveModel {
        id: Set(Uuid::new_v4()),
        purchaser_id: Set(purchaser.id),
        subtotal: Set(totals.subtotal),
        discount_amount: Set(totals.discount_amount),
        tax_amount: Set(totals.tax_amount),
        final_amount: Set(totals.final_amount),
        currency: Set(settings.currency.clone()),
        payment_method: Set(payment_method),
        invoice_reference: Set(invoice_reference
            .filter(|_| payment_method == PaymentMethod::BankTransfer)
            .map(|r| r.trim().to_string())),
        status: Set(PurchaseStatus::Pending),
        payment_status: Set(PaymentStatus::Unpaid),
        promo_code_id: Set(discount.as_ref().map(|d| d.promo_code_id)),
        promo_code: Set(discount.as_ref().map(|d| d.code.clone())),
        payment_reference: Set(None),
        paid_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(txn)
    .await?;

    let mut items = Vec::with_capacity(selection.lines.len());
    for line in &selection.lines {
        let item = purchase_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            purchase_id: Set(purchase.id),
            ticket_name: Set(line.ticket_type.clone()),
            quantity: Set(line.quantity as i32),
            unit_price: Set(line.unit_price),
            line_total: Set(line.line_total),
        }
        .insert(txn)
        .await?;
        items.push(item);
    }

    let slot_types = selection.slot_ticket_types();
    let mut attendee_rows = Vec::with_capacity(attendees.len());
    for (i, (input, ticket_type)) in attendees.iter().zip(slot_types).enumerate() {
        let row = attendee::ActiveModel {
            id: Set(Uuid::new_v4()),
            purchase_id: Set(purchase.id),
            purchaser_id: Set(purchaser.id),
            ticket_type: Set(ticket_type),
            full_name: Set(input.full_name.trim().to_string()),
            email: Set(input.email.trim().to_lowercase()),
            role: Set(input.role.trim().to_string()),
            organization: Set(input.organization.trim().to_string()),
            is_primary: Set(i == 0 && info.is_attending),
            created_at: Set(now),
        }
        .insert(txn)
        .await?;
        attendee_rows.push(row);
    }

    Ok(PurchaseResult {
        purchase,
        purchaser,
        items,
        attendees: attendee_rows,
        discount,
    })
}

pub(crate) async fn find_purchase_on<C: ConnectionTrait>(
    conn: &C,
    purchase_id: Uuid,
) -> Result<purchase::Model, ServiceError> {
    Purchase::find_by_id(purchase_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Purchase {} not found", purchase_id)))
}

pub(crate) async fn load_details<C: ConnectionTrait>(
    conn: &C,
    purchase_id: Uuid,
) -> Result<PurchaseDetails, ServiceError> {
    let purchase = find_purchase_on(conn, purchase_id).await?;
    let purchaser = Purchaser::find_by_id(purchase.purchaser_id)
        .one(conn)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Purchaser {} not found", purchase.purchaser_id))
        })?;
    let items = PurchaseItem::find()
        .filter(purchase_item::Column::PurchaseId.eq(purchase_id))
        .all(conn)
        .await?;
    let attendees = Attendee::find()
        .filter(attendee::Column::PurchaseId.eq(purchase_id))
        .order_by_desc(attendee::Column::IsPrimary)
        .all(conn)
        .await?;

    Ok(PurchaseDetails {
        purchase,
        purchaser,
        items,
        attendees,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn discount_then_tax() {
        let totals = PriceBreakdown::compute(dec!(190), dec!(38), Decimal::ZERO);
        assert_eq!(totals.final_amount, dec!(152.00));

        let totals = PriceBreakdown::compute(dec!(190), dec!(38), dec!(0.08));
        assert_eq!(totals.tax_amount, dec!(12.16));
        assert_eq!(totals.final_amount, dec!(164.16));
    }

    #[test]
    fn final_amount_never_negative() {
        let totals = PriceBreakdown::compute(dec!(95), dec!(500), dec!(0.1));
        assert_eq!(totals.discount_amount, dec!(95));
        assert_eq!(totals.tax_amount, Decimal::ZERO);
        assert_eq!(totals.final_amount, Decimal::ZERO);
    }
}
