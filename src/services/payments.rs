use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use rand::{distributions::Alphanumeric, Rng};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::OnConflict, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::with_transaction,
    entities::{
        payment_transaction::{self, Entity as PaymentTransaction, TransactionStatus},
        purchase::{self, Entity as Purchase, PaymentStatus, PurchaseStatus},
    },
    errors::{PromoCodeError, ServiceError},
    events::{Event, EventSender},
    gateway::{GatewayError, GatewayReadiness, InitializeRequest, PaymentGateway, Verification},
    notifications::{self, AttendeeSummary, ConfirmationNotifier, ConfirmationPayload, TicketSummary},
    services::{
        currency::{from_minor_units, to_minor_units, CurrencyResolver},
        promotions::PromotionService,
        purchases::{find_purchase_on, load_details, PurchaseDetails},
    },
};

/// What the client needs to open the gateway's payment widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementHandle {
    pub purchase_id: Uuid,
    pub reference: String,
    pub amount_minor: i64,
    pub currency: String,
    pub email: String,
    pub public_key: Option<String>,
    pub access_code: Option<String>,
    pub authorization_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// This call moved the purchase to paid
    Paid,
    /// Someone else already had
    AlreadyPaid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementCompletion {
    pub purchase_id: Uuid,
    pub reference: String,
    pub status: CompletionStatus,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    AwaitingPayment(SettlementHandle),
    Completed(SettlementCompletion),
}

/// Result reported by the client-side payment widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ClientCallback {
    Success { reference: String },
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayWebhookData {
    pub reference: String,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub customer: Option<JsonValue>,
}

/// Server-to-server notification from the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayWebhookEvent {
    pub event: String,
    pub data: GatewayWebhookData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Completed(SettlementCompletion),
    MarkedFailed(Uuid),
    Ignored(&'static str),
}

#[derive(Debug, Clone)]
pub struct PaymentSettings {
    pub init_timeout: Duration,
    pub verify_timeout: Duration,
    pub public_key: Option<String>,
    pub callback_url: Option<String>,
}

impl PaymentSettings {
    pub fn from_config(config: &crate::config::AppConfig) -> Self {
        Self {
            init_timeout: config.payment_gateway.init_timeout(),
            verify_timeout: config.payment_gateway.verify_timeout(),
            public_key: config.payment_gateway.public_key.clone(),
            callback_url: config.payment_gateway.callback_url.clone(),
        }
    }
}

/// Globally unique payment reference: `TKT-<millis>-<8 alphanumerics>`.
pub fn generate_reference() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!(
        "TKT-{}-{}",
        Utc::now().timestamp_millis(),
        suffix.to_uppercase()
    )
}

fn zero_cost_reference(purchase_id: Uuid) -> String {
    format!("FREE-{}", purchase_id.simple())
}

/// How a paid transition is recorded.
struct Settlement {
    reference: String,
    amount: Decimal,
    currency: String,
    canonical_amount: Decimal,
    status: TransactionStatus,
    raw: Option<JsonValue>,
}

struct PaidTransition {
    paid_at: DateTime<Utc>,
    promo_redeemed: bool,
}

/// Drives a pending purchase through the gateway to `paid` or `cancelled`.
///
/// Both the client callback and the gateway webhook funnel into
/// [`PaymentOrchestrator::verify_and_complete`]. The conditional
/// `pending -> paid` update is the only gate: whoever loses the race sees
/// `AlreadyPaid` and performs no side effects.
#[derive(Clone)]
pub struct PaymentOrchestrator {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    readiness: GatewayReadiness,
    notifier: Arc<dyn ConfirmationNotifier>,
    event_sender: Arc<EventSender>,
    currency: CurrencyResolver,
    settings: PaymentSettings,
}

impl PaymentOrchestrator {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        readiness: GatewayReadiness,
        notifier: Arc<dyn ConfirmationNotifier>,
        event_sender: Arc<EventSender>,
        currency: CurrencyResolver,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            db,
            gateway,
            readiness,
            notifier,
            event_sender,
            currency,
            settings,
        }
    }

    /// Opens a gateway charge for a pending purchase. Free orders are
    /// completed on the spot without touching the gateway.
    #[instrument(skip(self))]
    pub async fn initiate_settlement(
        &self,
        purchase_id: Uuid,
    ) -> Result<SettlementOutcome, ServiceError> {
        let purchase = find_purchase_on(&*self.db, purchase_id).await?;
        match purchase.status {
            PurchaseStatus::Paid => {
                return Ok(SettlementOutcome::Completed(already_paid(&purchase)));
            }
            PurchaseStatus::Cancelled => {
                return Err(ServiceError::InvalidOperation(format!(
                    "Purchase {} was cancelled",
                    purchase_id
                )));
            }
            PurchaseStatus::Pending => {}
        }

        if purchase.final_amount <= Decimal::ZERO {
            let completion = self.complete_zero_cost(&purchase).await?;
            return Ok(SettlementOutcome::Completed(completion));
        }

        let reference = generate_reference();
        let updated = Purchase::update_many()
            .set(purchase::ActiveModel {
                payment_reference: Set(Some(reference.clone())),
                payment_status: Set(PaymentStatus::Awaiting),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(purchase::Column::Id.eq(purchase_id))
            .filter(purchase::Column::Status.eq(PurchaseStatus::Pending))
            .exec(&*self.db)
            .await?;
        if updated.rows_affected == 0 {
            return Err(ServiceError::Conflict(format!(
                "Purchase {} is no longer pending",
                purchase_id
            )));
        }

        let details = load_details(&*self.db, purchase_id).await?;
        let charge = self
            .currency
            .charge_for(purchase.payment_method, purchase.final_amount)?;
        let amount_minor = to_minor_units(charge.amount)?;

        let request = InitializeRequest {
            reference: reference.clone(),
            amount_minor,
            currency: charge.currency.clone(),
            email: details.purchaser.email.clone(),
            callback_url: self.settings.callback_url.clone(),
            metadata: gateway_metadata(&details),
        };

        let gateway = Arc::clone(&self.gateway);
        let readiness = self.readiness.clone();
        let response = tokio::time::timeout(self.settings.init_timeout, async move {
            readiness.wait_ready().await?;
            gateway.initialize(request).await
        })
        .await
        .map_err(|_| GatewayError::Timeout("initialize"))??;

        info!(%reference, amount_minor, currency = %charge.currency, "settlement initiated");
        counter!("checkout_settlements_total", 1, "outcome" => "initiated");

        Ok(SettlementOutcome::AwaitingPayment(SettlementHandle {
            purchase_id,
            reference,
            amount_minor,
            currency: charge.currency,
            email: details.purchaser.email,
            public_key: self.settings.public_key.clone(),
            access_code: response.access_code,
            authorization_url: response.authorization_url,
        }))
    }

    /// Verifies `reference` with the gateway and, on success, marks the
    /// purchase paid. Safe to call any number of times from any path.
    #[instrument(skip(self))]
    pub async fn verify_and_complete(
        &self,
        purchase_id: Uuid,
        reference: &str,
    ) -> Result<SettlementCompletion, ServiceError> {
        let purchase = find_purchase_on(&*self.db, purchase_id).await?;
        match purchase.status {
            PurchaseStatus::Paid => return Ok(already_paid(&purchase)),
            PurchaseStatus::Cancelled => {
                return Err(ServiceError::InvalidOperation(format!(
                    "Purchase {} was cancelled",
                    purchase_id
                )));
            }
            PurchaseStatus::Pending => {}
        }
        if purchase.payment_reference.as_deref() != Some(reference) {
            return Err(ServiceError::BadRequest(format!(
                "Reference {} does not belong to purchase {}",
                reference, purchase_id
            )));
        }

        let verification = tokio::time::timeout(
            self.settings.verify_timeout,
            self.gateway.verify(reference),
        )
        .await
        .map_err(|_| GatewayError::Timeout("verify"))??;

        let charge = self
            .currency
            .charge_for(purchase.payment_method, purchase.final_amount)?;
        let expected_minor = to_minor_units(charge.amount)?;

        if let Some(reason) = rejection_reason(&verification, expected_minor, &charge.currency) {
            warn!(%reference, %reason, "payment verification failed");
            if !self
                .cancel_pending(purchase_id, PaymentStatus::Failed, &reason)
                .await?
            {
                // Another path settled it while the gateway was answering.
                let current = find_purchase_on(&*self.db, purchase_id).await?;
                if current.status == PurchaseStatus::Paid {
                    return Ok(already_paid(&current));
                }
            }
            counter!("checkout_settlements_total", 1, "outcome" => "failed");
            return Err(ServiceError::VerificationFailed(reason));
        }

        let amount = from_minor_units(verification.amount_minor);
        let settlement = Settlement {
            reference: reference.to_string(),
            amount,
            currency: verification.currency.clone(),
            canonical_amount: self
                .currency
                .canonical_amount(amount, &verification.currency)?,
            status: TransactionStatus::Success,
            raw: Some(verification.raw.clone()),
        };

        self.finalize(&purchase, settlement).await
    }

    /// Handles what the payment widget reports back.
    #[instrument(skip(self))]
    pub async fn handle_client_callback(
        &self,
        purchase_id: Uuid,
        callback: ClientCallback,
    ) -> Result<SettlementCompletion, ServiceError> {
        match callback {
            ClientCallback::Success { reference } => {
                self.verify_and_complete(purchase_id, &reference).await
            }
            ClientCallback::Closed => {
                if self
                    .cancel_pending(purchase_id, PaymentStatus::Cancelled, "payment window closed")
                    .await?
                {
                    return Err(ServiceError::PaymentCancelled(purchase_id.to_string()));
                }

                // The webhook may have won while the widget was closing.
                let purchase = find_purchase_on(&*self.db, purchase_id).await?;
                if purchase.status == PurchaseStatus::Paid {
                    Ok(already_paid(&purchase))
                } else {
                    Err(ServiceError::PaymentCancelled(purchase_id.to_string()))
                }
            }
        }
    }

    /// Applies a gateway webhook. Unknown references and settled purchases
    /// are ignored.
    #[instrument(skip(self, event), fields(event = %event.event, reference = %event.data.reference))]
    pub async fn handle_webhook(
        &self,
        event: GatewayWebhookEvent,
    ) -> Result<WebhookOutcome, ServiceError> {
        let Some(purchase) = self.find_by_reference(&event.data.reference).await? else {
            debug!("webhook for unknown reference");
            return Ok(WebhookOutcome::Ignored("unknown reference"));
        };
        if purchase.is_terminal() {
            return Ok(WebhookOutcome::Ignored("purchase already settled"));
        }

        match event.event.as_str() {
            "charge.success" => {
                let completion = self
                    .verify_and_complete(purchase.id, &event.data.reference)
                    .await?;
                Ok(WebhookOutcome::Completed(completion))
            }
            "charge.failed" => {
                self.mark_failed(purchase.id, "gateway reported charge failure")
                    .await?;
                Ok(WebhookOutcome::MarkedFailed(purchase.id))
            }
            _ => Ok(WebhookOutcome::Ignored("unhandled event type")),
        }
    }

    /// Cancels a pending purchase after a failed charge. Returns whether
    /// this call made the transition.
    pub async fn mark_failed(&self, purchase_id: Uuid, reason: &str) -> Result<bool, ServiceError> {
        self.cancel_pending(purchase_id, PaymentStatus::Failed, reason)
            .await
    }

    /// Cancels a pending purchase that will never be paid.
    pub async fn cancel_purchase(&self, purchase_id: Uuid, reason: &str) -> Result<bool, ServiceError> {
        self.cancel_pending(purchase_id, PaymentStatus::Cancelled, reason)
            .await
    }

    pub async fn find_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<purchase::Model>, ServiceError> {
        let purchase = Purchase::find()
            .filter(purchase::Column::PaymentReference.eq(reference))
            .one(&*self.db)
            .await?;
        Ok(purchase)
    }

    async fn complete_zero_cost(
        &self,
        purchase: &purchase::Model,
    ) -> Result<SettlementCompletion, ServiceError> {
        let settlement = Settlement {
            reference: zero_cost_reference(purchase.id),
            amount: Decimal::ZERO,
            currency: purchase.currency.clone(),
            canonical_amount: Decimal::ZERO,
            status: TransactionStatus::ZeroCost,
            raw: None,
        };
        self.finalize(purchase, settlement).await
    }

    /// Runs the paid transition and its side effects.
    async fn finalize(
        &self,
        purchase: &purchase::Model,
        settlement: Settlement,
    ) -> Result<SettlementCompletion, ServiceError> {
        let purchase_id = purchase.id;
        let promo_code_id = purchase.promo_code_id;
        let reference = settlement.reference.clone();

        let transition = with_transaction(&*self.db, move |txn| {
            Box::pin(async move { mark_paid(txn, purchase_id, promo_code_id, settlement).await })
        })
        .await?;

        let Some(transition) = transition else {
            let current = find_purchase_on(&*self.db, purchase_id).await?;
            return match current.status {
                PurchaseStatus::Paid => {
                    debug!(%purchase_id, "lost settlement race, already paid");
                    Ok(already_paid(&current))
                }
                _ => Err(ServiceError::InvalidOperation(format!(
                    "Purchase {} was cancelled",
                    purchase_id
                ))),
            };
        };

        info!(%purchase_id, %reference, "purchase paid");
        counter!("checkout_settlements_total", 1, "outcome" => "paid");

        self.event_sender
            .send_or_log(Event::PurchasePaid {
                purchase_id,
                payment_reference: reference.clone(),
                paid_at: transition.paid_at,
            })
            .await;
        if transition.promo_redeemed {
            if let (Some(promo_code_id), Some(code)) = (promo_code_id, purchase.promo_code.clone()) {
                self.event_sender
                    .send_or_log(Event::PromoCodeRedeemed {
                        promo_code_id,
                        code,
                        purchase_id,
                    })
                    .await;
            }
        }

        match load_details(&*self.db, purchase_id).await {
            Ok(details) => notifications::dispatch(
                Arc::clone(&self.notifier),
                confirmation_payload(&details, &reference, transition.paid_at),
            ),
            Err(e) => warn!(%purchase_id, error = %e, "could not load purchase for confirmation"),
        }

        Ok(SettlementCompletion {
            purchase_id,
            reference,
            status: CompletionStatus::Paid,
            paid_at: transition.paid_at,
        })
    }

    async fn cancel_pending(
        &self,
        purchase_id: Uuid,
        payment_status: PaymentStatus,
        reason: &str,
    ) -> Result<bool, ServiceError> {
        let result = Purchase::update_many()
            .set(purchase::ActiveModel {
                status: Set(PurchaseStatus::Cancelled),
                payment_status: Set(payment_status),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(purchase::Column::Id.eq(purchase_id))
            .filter(purchase::Column::Status.eq(PurchaseStatus::Pending))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Ok(false);
        }

        info!(%purchase_id, %reason, "purchase cancelled");
        counter!("checkout_cancellations_total", 1);
        self.event_sender
            .send_or_log(Event::PurchaseCancelled {
                purchase_id,
                reason: reason.to_string(),
            })
            .await;
        Ok(true)
    }
}

/// The conditional transition goes first; a no-op there means another
/// caller already settled, and nothing else in the transaction runs.
async fn mark_paid<C: ConnectionTrait>(
    txn: &C,
    purchase_id: Uuid,
    promo_code_id: Option<Uuid>,
    settlement: Settlement,
) -> Result<Option<PaidTransition>, ServiceError> {
    let paid_at = Utc::now();

    let updated = Purchase::update_many()
        .set(purchase::ActiveModel {
            status: Set(PurchaseStatus::Paid),
            payment_status: Set(PaymentStatus::Paid),
            payment_reference: Set(Some(settlement.reference.clone())),
            paid_at: Set(Some(paid_at)),
            updated_at: Set(paid_at),
            ..Default::default()
        })
        .filter(purchase::Column::Id.eq(purchase_id))
        .filter(purchase::Column::Status.eq(PurchaseStatus::Pending))
        .exec(txn)
        .await?;
    if updated.rows_affected == 0 {
        return Ok(None);
    }

    let row = payment_transaction::ActiveModel {
        id: Set(Uuid::new_v4()),
        purchase_id: Set(purchase_id),
        gateway_reference: Set(settlement.reference.clone()),
        amount: Set(settlement.amount),
        currency: Set(settlement.currency),
        canonical_amount: Set(settlement.canonical_amount),
        status: Set(settlement.status),
        gateway_response: Set(settlement.raw),
        created_at: Set(paid_at),
    };
    let inserted = PaymentTransaction::insert(row)
        .on_conflict(
            OnConflict::column(payment_transaction::Column::GatewayReference)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(txn)
        .await?;
    if inserted == 0 {
        debug!(reference = %settlement.reference, "payment transaction already recorded");
    }

    let mut promo_redeemed = false;
    if let Some(promo_code_id) = promo_code_id {
        match PromotionService::commit_usage_on(txn, promo_code_id).await {
            Ok(()) => promo_redeemed = true,
            Err(ServiceError::PromoCode(PromoCodeError::UsageLimitExceeded(code))) => {
                // The money is already taken; honour the discount.
                warn!(%code, %purchase_id, "promo code exhausted before settlement");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(Some(PaidTransition {
        paid_at,
        promo_redeemed,
    }))
}

fn rejection_reason(
    verification: &Verification,
    expected_minor: i64,
    expected_currency: &str,
) -> Option<String> {
    if !verification.is_success() {
        return Some(
            verification
                .message
                .clone()
                .unwrap_or_else(|| format!("gateway status {}", verification.status)),
        );
    }
    if !verification.currency.eq_ignore_ascii_case(expected_currency) {
        return Some(format!(
            "charged in {} instead of {}",
            verification.currency, expected_currency
        ));
    }
    if verification.amount_minor < expected_minor {
        return Some(format!(
            "charged {} minor units, expected {}",
            verification.amount_minor, expected_minor
        ));
    }
    None
}

/// Completion for a purchase some earlier call already settled.
pub fn already_paid(purchase: &purchase::Model) -> SettlementCompletion {
    SettlementCompletion {
        purchase_id: purchase.id,
        reference: purchase.payment_reference.clone().unwrap_or_default(),
        status: CompletionStatus::AlreadyPaid,
        paid_at: purchase.paid_at.unwrap_or(purchase.updated_at),
    }
}

fn gateway_metadata(details: &PurchaseDetails) -> JsonValue {
    let ticket_types: Vec<&str> = details
        .items
        .iter()
        .map(|item| item.ticket_name.as_str())
        .collect();

    json!({
        "purchase_id": details.purchase.id,
        "full_name": details.purchaser.full_name,
        "organization": details.purchaser.organization,
        "ticket_types": ticket_types,
        "attendee_count": details.attendees.len(),
        "invoice_reference": details.purchase.invoice_reference,
        "payment_method": details.purchase.payment_method.as_str(),
    })
}

fn confirmation_payload(
    details: &PurchaseDetails,
    reference: &str,
    paid_at: DateTime<Utc>,
) -> ConfirmationPayload {
    ConfirmationPayload {
        purchase_id: details.purchase.id,
        purchaser_name: details.purchaser.full_name.clone(),
        purchaser_email: details.purchaser.email.clone(),
        organization: details.purchaser.organization.clone(),
        tickets: details
            .items
            .iter()
            .map(|item| TicketSummary {
                ticket_type: item.ticket_name.clone(),
                quantity: item.quantity,
                line_total: item.line_total,
            })
            .collect(),
        attendees: details
            .attendees
            .iter()
            .map(|a| AttendeeSummary {
                full_name: a.full_name.clone(),
                email: a.email.clone(),
                ticket_type: a.ticket_type.clone(),
            })
            .collect(),
        subtotal: details.purchase.subtotal,
        discount_amount: details.purchase.discount_amount,
        tax_amount: details.purchase.tax_amount,
        final_amount: details.purchase.final_amount,
        currency: details.purchase.currency.clone(),
        payment_method: details.purchase.payment_method.as_str().to_string(),
        payment_reference: reference.to_string(),
        promo_code: details.purchase.promo_code.clone(),
        paid_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verification(status: &str, amount_minor: i64, currency: &str) -> Verification {
        Verification {
            reference: "TKT-1-ABC".into(),
            status: status.into(),
            amount_minor,
            currency: currency.into(),
            message: None,
            raw: JsonValue::Null,
        }
    }

    #[test]
    fn references_are_unique_and_prefixed() {
        let a = generate_reference();
        let b = generate_reference();
        assert!(a.starts_with("TKT-"));
        assert_ne!(a, b);
        let suffix = a.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn rejects_failed_short_or_wrong_currency_charges() {
        assert_eq!(rejection_reason(&verification("success", 15200, "USD"), 15200, "USD"), None);
        assert_eq!(rejection_reason(&verification("success", 16000, "usd"), 15200, "USD"), None);
        assert!(rejection_reason(&verification("failed", 15200, "USD"), 15200, "USD").is_some());
        assert!(rejection_reason(&verification("success", 15100, "USD"), 15200, "USD").is_some());
        assert!(rejection_reason(&verification("success", 15200, "KES"), 15200, "USD").is_some());
    }

    #[test]
    fn outcomes_serialize_with_tags() {
        let callback: ClientCallback =
            serde_json::from_value(json!({"result": "success", "reference": "TKT-1"})).unwrap();
        assert_eq!(
            callback,
            ClientCallback::Success {
                reference: "TKT-1".into()
            }
        );
        let closed: ClientCallback = serde_json::from_value(json!({"result": "closed"})).unwrap();
        assert_eq!(closed, ClientCallback::Closed);
    }
}
