//! Multi-step checkout flow.
//!
//! Sessions live in memory and carry every value entered so far. Each
//! `submit_*` call validates its step, stores the input and advances; a
//! failed validation leaves the session where it was.

pub mod session;
pub mod validation;

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::{AppConfig, TicketTypeConfig},
    entities::{
        lead::LeadStatus,
        purchase::{self, PurchaseStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        leads::LeadService,
        payments::{already_paid, ClientCallback, PaymentOrchestrator, SettlementOutcome},
        promotions::PromotionService,
        purchases::{PriceBreakdown, PurchaseRequest, PurchaseService, PurchaserInfo},
    },
};

use self::session::{
    AppliedPromo, AttendeeDetails, CheckoutSession, CheckoutStep, ContactInfo, PaymentDetails,
    SessionStore, TicketLineInput,
};
use self::validation::{price_selection, validate_attendees, validate_contact, validate_payment};

#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub catalog: Vec<TicketTypeConfig>,
    pub tax_rate: Decimal,
    pub lead_skip_window: Duration,
}

impl CheckoutSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            catalog: config.tickets.clone(),
            tax_rate: config.tax_rate,
            lead_skip_window: config.lead_skip_window(),
        }
    }
}

/// Result of the payment step.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentSubmission {
    pub session: CheckoutSession,
    pub outcome: SettlementOutcome,
}

#[derive(Clone)]
pub struct CheckoutService {
    sessions: Arc<SessionStore>,
    leads: Arc<LeadService>,
    promotions: Arc<PromotionService>,
    purchases: Arc<PurchaseService>,
    payments: Arc<PaymentOrchestrator>,
    event_sender: Arc<EventSender>,
    settings: CheckoutSettings,
}

impl CheckoutService {
    pub fn new(
        sessions: Arc<SessionStore>,
        leads: Arc<LeadService>,
        promotions: Arc<PromotionService>,
        purchases: Arc<PurchaseService>,
        payments: Arc<PaymentOrchestrator>,
        event_sender: Arc<EventSender>,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            sessions,
            leads,
            promotions,
            purchases,
            payments,
            event_sender,
            settings,
        }
    }

    pub fn catalog(&self) -> &[TicketTypeConfig] {
        &self.settings.catalog
    }

    /// Opens a session. A purchaser whose lead was refreshed within the skip
    /// window starts at ticket selection with contact details filled in.
    #[instrument(skip(self))]
    pub async fn start_session(
        &self,
        known_email: Option<&str>,
    ) -> Result<CheckoutSession, ServiceError> {
        let mut session = CheckoutSession::new();

        if let Some(email) = known_email.map(str::trim).filter(|e| !e.is_empty()) {
            if let Some(lead) = self
                .leads
                .find_recent_lead(email, self.settings.lead_skip_window)
                .await?
            {
                debug!(lead_id = %lead.id, "recent lead found, skipping contact step");
                session.contact = Some(ContactInfo {
                    full_name: lead.full_name,
                    email: lead.email,
                    phone: lead.phone,
                    country: lead.country,
                });
                session.contact_prefilled = true;
                session.step = CheckoutStep::TicketSelection;
            }
        }

        self.sessions.put(session.clone());
        Ok(session)
    }

    pub fn get_session(&self, session_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        self.sessions.get(session_id)
    }

    #[instrument(skip(self, contact))]
    pub async fn submit_contact(
        &self,
        session_id: Uuid,
        contact: ContactInfo,
    ) -> Result<CheckoutSession, ServiceError> {
        let _guard = self.sessions.lock(session_id).await?;
        let mut session = self.sessions.get(session_id)?;
        session.expect_step(CheckoutStep::ContactInfo)?;
        validate_contact(&contact)?;

        let lead = self
            .leads
            .capture_lead(&contact, Some(json!({ "session_id": session_id })))
            .await?;
        self.event_sender
            .send_or_log(Event::LeadCaptured {
                lead_id: lead.id,
                email: lead.email.clone(),
            })
            .await;

        session.contact = Some(ContactInfo {
            email: lead.email,
            ..contact
        });
        session.advance()?;
        self.sessions.put(session.clone());
        Ok(session)
    }

    #[instrument(skip(self, lines))]
    pub async fn submit_tickets(
        &self,
        session_id: Uuid,
        lines: Vec<TicketLineInput>,
    ) -> Result<CheckoutSession, ServiceError> {
        let _guard = self.sessions.lock(session_id).await?;
        let mut session = self.sessions.get(session_id)?;
        session.expect_step(CheckoutStep::TicketSelection)?;
        let selection = price_selection(&lines, &self.settings.catalog)?;

        if session.tickets.as_ref() != Some(&selection) {
            // A discount was validated against the old selection.
            session.promo = None;
            session.totals = None;
        }
        session.tickets = Some(selection);
        session.advance()?;
        self.sessions.put(session.clone());

        self.mark_lead(&session, LeadStatus::TicketsSelected).await;
        Ok(session)
    }

    #[instrument(skip(self, details))]
    pub async fn submit_attendees(
        &self,
        session_id: Uuid,
        details: AttendeeDetails,
    ) -> Result<CheckoutSession, ServiceError> {
        let _guard = self.sessions.lock(session_id).await?;
        let mut session = self.sessions.get(session_id)?;
        session.expect_step(CheckoutStep::AttendeeDetails)?;
        let selection = session.tickets.as_ref().ok_or_else(|| {
            ServiceError::InvalidOperation("select tickets before entering attendees".into())
        })?;
        validate_attendees(&details, selection)?;

        session.totals = Some(self.totals_for(&session, selection.subtotal()));
        session.attendee_details = Some(details);
        session.advance()?;
        self.sessions.put(session.clone());

        self.mark_lead(&session, LeadStatus::AttendeesEntered).await;
        Ok(session)
    }

    /// Validates a promo code against the current selection and shows the
    /// discounted totals. Usage is only consumed once payment settles.
    #[instrument(skip(self))]
    pub async fn apply_promo_code(
        &self,
        session_id: Uuid,
        code: &str,
    ) -> Result<CheckoutSession, ServiceError> {
        let _guard = self.sessions.lock(session_id).await?;
        let mut session = self.sessions.get(session_id)?;
        session.expect_step(CheckoutStep::Payment)?;
        let selection = session.tickets.as_ref().ok_or_else(|| {
            ServiceError::InvalidOperation("select tickets before applying a promo code".into())
        })?;

        let candidate = self.purchases.candidate_for(selection);
        let discount = self
            .promotions
            .validate(code, &candidate, Utc::now())
            .await?;

        session.promo = Some(AppliedPromo {
            promo_code_id: discount.promo_code_id,
            code: discount.code,
            amount: discount.amount,
            description: discount.description,
        });
        session.totals = Some(self.totals_for(&session, candidate.total));
        session.touch();
        self.sessions.put(session.clone());
        Ok(session)
    }

    /// Records the purchase and opens settlement. Free orders complete here.
    #[instrument(skip(self, payment))]
    pub async fn submit_payment(
        &self,
        session_id: Uuid,
        payment: PaymentDetails,
    ) -> Result<PaymentSubmission, ServiceError> {
        let _guard = self.sessions.lock(session_id).await?;
        let mut session = self.sessions.get(session_id)?;
        session.expect_step(CheckoutStep::Payment)?;
        validate_payment(&payment)?;

        if let Some(previous) = session.purchase_id {
            let purchase = self.purchases.find_purchase(previous).await?;
            if let Some(submission) = self
                .reuse_previous(&mut session, &purchase, &payment)
                .await?
            {
                return Ok(submission);
            }

            // Method or invoice changed: the old order will never be paid.
            if purchase.status == PurchaseStatus::Pending
                && !self.payments.cancel_purchase(previous, "payment resubmitted").await?
            {
                // Settled between the read and the cancel.
                let purchase = self.purchases.find_purchase(previous).await?;
                if let Some(submission) = self
                    .reuse_previous(&mut session, &purchase, &payment)
                    .await?
                {
                    return Ok(submission);
                }
            }
            debug!(purchase_id = %previous, "superseded purchase");
            session.purchase_id = None;
            session.settlement = None;
        }

        let request = self.purchase_request(&session, &payment)?;
        let result = match self.purchases.complete_purchase(request).await {
            Ok(result) => result,
            Err(e @ ServiceError::PromoCode(_)) => {
                // The code went stale between apply and pay; drop it.
                session.promo = None;
                let totals = session
                    .tickets
                    .as_ref()
                    .map(|t| self.totals_for(&session, t.subtotal()));
                session.totals = totals;
                session.touch();
                self.sessions.put(session);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        session.purchase_id = Some(result.purchase.id);
        session.payment = Some(payment);
        session.totals = Some(PriceBreakdown {
            subtotal: result.purchase.subtotal,
            discount_amount: result.purchase.discount_amount,
            tax_amount: result.purchase.tax_amount,
            final_amount: result.purchase.final_amount,
        });
        session.touch();
        self.sessions.put(session.clone());
        self.mark_lead(&session, LeadStatus::PaymentPending).await;

        let outcome = self.payments.initiate_settlement(result.purchase.id).await?;
        match &outcome {
            SettlementOutcome::AwaitingPayment(handle) => {
                session.settlement = Some(handle.clone());
                session.touch();
            }
            SettlementOutcome::Completed(_) => {
                session.advance()?;
                self.mark_lead(&session, LeadStatus::Converted).await;
            }
        }
        self.sessions.put(session.clone());

        info!(
            purchase_id = %result.purchase.id,
            step = session.step.as_str(),
            "payment submitted"
        );
        Ok(PaymentSubmission { session, outcome })
    }

    /// Applies the payment widget's result to the session.
    #[instrument(skip(self, callback))]
    pub async fn handle_settlement_callback(
        &self,
        session_id: Uuid,
        callback: ClientCallback,
    ) -> Result<CheckoutSession, ServiceError> {
        let _guard = self.sessions.lock(session_id).await?;
        let mut session = self.sessions.get(session_id)?;
        session.expect_step(CheckoutStep::Payment)?;
        let purchase_id = session.purchase_id.ok_or_else(|| {
            ServiceError::InvalidOperation("no payment has been started".into())
        })?;

        match self
            .payments
            .handle_client_callback(purchase_id, callback)
            .await
        {
            Ok(_) => {
                session.advance()?;
                self.sessions.put(session.clone());
                self.mark_lead(&session, LeadStatus::Converted).await;
                Ok(session)
            }
            Err(e @ (ServiceError::PaymentCancelled(_) | ServiceError::VerificationFailed(_))) => {
                warn!(%purchase_id, error = %e, "checkout cancelled");
                session.step = CheckoutStep::Cancelled;
                session.touch();
                self.sessions.put(session);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Steps back one page, keeping everything entered so far.
    pub async fn prev(&self, session_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        let _guard = self.sessions.lock(session_id).await?;
        let mut session = self.sessions.get(session_id)?;

        if session.step == CheckoutStep::Payment {
            if let Some(purchase_id) = session.purchase_id {
                let purchase = self.purchases.find_purchase(purchase_id).await?;
                match purchase.status {
                    PurchaseStatus::Cancelled => {}
                    PurchaseStatus::Paid => {
                        return Err(ServiceError::InvalidOperation(
                            "this checkout has already been paid".into(),
                        ));
                    }
                    PurchaseStatus::Pending => {
                        return Err(ServiceError::InvalidOperation(
                            "a payment is in progress for this checkout".into(),
                        ));
                    }
                }
            }
        }

        session.step = session.step.prev().ok_or_else(|| {
            ServiceError::InvalidOperation(format!(
                "cannot go back from {}",
                session.step.as_str()
            ))
        })?;
        session.touch();
        self.sessions.put(session.clone());
        Ok(session)
    }

    /// Decides whether a new payment submission can be answered from the
    /// session's existing purchase. A paid purchase completes the session;
    /// an identical resubmission gets the charge that is already open.
    async fn reuse_previous(
        &self,
        session: &mut CheckoutSession,
        purchase: &purchase::Model,
        payment: &PaymentDetails,
    ) -> Result<Option<PaymentSubmission>, ServiceError> {
        match purchase.status {
            PurchaseStatus::Paid => {
                info!(purchase_id = %purchase.id, "purchase already paid, completing session");
                session.step = CheckoutStep::Completed;
                session.touch();
                self.sessions.put(session.clone());
                self.mark_lead(session, LeadStatus::Converted).await;
                Ok(Some(PaymentSubmission {
                    session: session.clone(),
                    outcome: SettlementOutcome::Completed(already_paid(purchase)),
                }))
            }
            PurchaseStatus::Pending if session.payment.as_ref() == Some(payment) => {
                match &session.settlement {
                    Some(handle) if handle.purchase_id == purchase.id => {
                        debug!(purchase_id = %purchase.id, "payment resubmitted unchanged");
                        Ok(Some(PaymentSubmission {
                            session: session.clone(),
                            outcome: SettlementOutcome::AwaitingPayment(handle.clone()),
                        }))
                    }
                    _ => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    pub fn purge_idle_sessions(&self, max_idle: Duration) -> usize {
        let removed = self.sessions.purge_idle(max_idle, Utc::now());
        if removed > 0 {
            debug!(removed, "purged idle checkout sessions");
        }
        removed
    }

    fn totals_for(&self, session: &CheckoutSession, subtotal: Decimal) -> PriceBreakdown {
        let discount = session.promo.as_ref().map_or(Decimal::ZERO, |p| p.amount);
        PriceBreakdown::compute(subtotal, discount, self.settings.tax_rate)
    }

    fn purchase_request(
        &self,
        session: &CheckoutSession,
        payment: &PaymentDetails,
    ) -> Result<PurchaseRequest, ServiceError> {
        let missing = |what: &str| ServiceError::InvalidOperation(format!("{} missing", what));
        let contact = session.contact.as_ref().ok_or_else(|| missing("contact details"))?;
        let selection = session.tickets.as_ref().ok_or_else(|| missing("ticket selection"))?;
        let details = session
            .attendee_details
            .as_ref()
            .ok_or_else(|| missing("attendee details"))?;

        Ok(PurchaseRequest {
            purchaser: PurchaserInfo {
                full_name: contact.full_name.clone(),
                email: contact.email.clone(),
                phone: contact.phone.clone(),
                organization: Some(details.organization.trim().to_string()),
                country: contact.country.clone(),
                is_attending: details.is_attending,
                terms_accepted: details.terms_accepted,
                updates_consent: details.updates_consent,
            },
            selection: selection.clone(),
            attendees: details.attendees.clone(),
            payment_method: payment.payment_method,
            invoice_reference: payment.invoice_reference.clone(),
            promo_code: session.promo.as_ref().map(|p| p.code.clone()),
        })
    }

    async fn mark_lead(&self, session: &CheckoutSession, status: LeadStatus) {
        if let Some(contact) = &session.contact {
            self.leads.update_lead_status(&contact.email, status).await;
        }
    }
}
