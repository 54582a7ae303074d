use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::entities::purchase::PaymentMethod;
use crate::errors::ServiceError;
use crate::services::payments::SettlementHandle;
use crate::services::purchases::PriceBreakdown;

/// Ordered checkout steps. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStep {
    ContactInfo,
    TicketSelection,
    AttendeeDetails,
    Payment,
    Completed,
    Cancelled,
}

impl CheckoutStep {
    pub fn next(self) -> Option<Self> {
        match self {
            Self::ContactInfo => Some(Self::TicketSelection),
            Self::TicketSelection => Some(Self::AttendeeDetails),
            Self::AttendeeDetails => Some(Self::Payment),
            Self::Payment => Some(Self::Completed),
            Self::Completed | Self::Cancelled => None,
        }
    }

    pub fn prev(self) -> Option<Self> {
        match self {
            Self::TicketSelection => Some(Self::ContactInfo),
            Self::AttendeeDetails => Some(Self::TicketSelection),
            Self::Payment => Some(Self::AttendeeDetails),
            Self::ContactInfo | Self::Completed | Self::Cancelled => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContactInfo => "contact_info",
            Self::TicketSelection => "ticket_selection",
            Self::AttendeeDetails => "attendee_details",
            Self::Payment => "payment",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

pub(crate) fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("required");
        err.message = Some("This field is required".into());
        return Err(err);
    }
    Ok(())
}

/// Step 1 input
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ContactInfo {
    #[validate(custom = "not_blank")]
    pub full_name: String,
    #[validate(email(message = "Enter a valid email address"))]
    pub email: String,
    #[validate(custom = "not_blank")]
    pub phone: String,
    #[validate(custom = "not_blank")]
    pub country: String,
}

/// Step 2 input line, as sent by the client. Prices are never accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketLineInput {
    pub ticket_type: String,
    pub quantity: u32,
}

/// A selection line priced from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedTicketLine {
    pub ticket_type: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TicketSelection {
    pub lines: Vec<PricedTicketLine>,
}

impl TicketSelection {
    pub fn subtotal(&self) -> Decimal {
        self.lines.iter().map(|line| line.line_total).sum()
    }

    pub fn total_quantity(&self) -> usize {
        self.lines.iter().map(|line| line.quantity as usize).sum()
    }

    pub fn ticket_types(&self) -> Vec<String> {
        self.lines.iter().map(|line| line.ticket_type.clone()).collect()
    }

    /// Ticket type for each attendee slot, in selection order.
    pub fn slot_ticket_types(&self) -> Vec<String> {
        self.lines
            .iter()
            .flat_map(|line| std::iter::repeat(line.ticket_type.clone()).take(line.quantity as usize))
            .collect()
    }
}

/// One attendee slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendeeInput {
    pub full_name: String,
    pub email: String,
    pub role: String,
    pub organization: String,
}

/// Step 3 input
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendeeDetails {
    pub organization: String,
    /// Whether the purchaser is also the first attendee
    #[serde(default)]
    pub is_attending: bool,
    #[serde(default)]
    pub terms_accepted: bool,
    #[serde(default)]
    pub updates_consent: bool,
    pub attendees: Vec<AttendeeInput>,
}

/// Step 4 input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub invoice_reference: Option<String>,
}

/// A promo code accepted for this session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedPromo {
    pub promo_code_id: Uuid,
    pub code: String,
    pub amount: Decimal,
    pub description: Option<String>,
}

/// Everything entered so far. Going back never discards data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: Uuid,
    pub step: CheckoutStep,
    pub contact: Option<ContactInfo>,
    /// True when step 1 was skipped using a recent lead
    pub contact_prefilled: bool,
    pub tickets: Option<TicketSelection>,
    pub attendee_details: Option<AttendeeDetails>,
    pub promo: Option<AppliedPromo>,
    pub payment: Option<PaymentDetails>,
    pub totals: Option<PriceBreakdown>,
    pub purchase_id: Option<Uuid>,
    pub settlement: Option<SettlementHandle>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckoutSession {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            step: CheckoutStep::ContactInfo,
            contact: None,
            contact_prefilled: false,
            tickets: None,
            attendee_details: None,
            promo: None,
            payment: None,
            totals: None,
            purchase_id: None,
            settlement: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fails unless the session currently sits at `step`.
    pub fn expect_step(&self, step: CheckoutStep) -> Result<(), ServiceError> {
        if self.step == step {
            Ok(())
        } else {
            Err(ServiceError::InvalidOperation(format!(
                "checkout is at step {}, not {}",
                self.step.as_str(),
                step.as_str()
            )))
        }
    }

    pub fn advance(&mut self) -> Result<(), ServiceError> {
        let next = self.step.next().ok_or_else(|| {
            ServiceError::InvalidOperation(format!(
                "checkout cannot advance from {}",
                self.step.as_str()
            ))
        })?;
        self.step = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for CheckoutSession {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory session store. Callers take a copy, mutate it and store it
/// back; no map guard is held across an await point. Anything that changes
/// a session holds its [`SessionStore::lock`] for the whole read-modify-write.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<Uuid, CheckoutSession>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Result<CheckoutSession, ServiceError> {
        self.sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_found(id))
    }

    pub fn put(&self, session: CheckoutSession) {
        self.sessions.insert(session.id, session);
    }

    /// Waits for exclusive use of a session.
    pub async fn lock(&self, id: Uuid) -> Result<OwnedMutexGuard<()>, ServiceError> {
        if !self.sessions.contains_key(&id) {
            return Err(not_found(id));
        }
        let lock = Arc::clone(self.locks.entry(id).or_default().value());
        Ok(lock.lock_owned().await)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drops sessions untouched for longer than `max_idle`. Returns how many
    /// were removed.
    pub fn purge_idle(&self, max_idle: chrono::Duration, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| now - session.updated_at <= max_idle);
        self.locks.retain(|id, _| self.sessions.contains_key(id));
        before - self.sessions.len()
    }
}

fn not_found(id: Uuid) -> ServiceError {
    ServiceError::NotFound(format!("Checkout session {} not found", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn steps_move_in_order() {
        let mut step = CheckoutStep::ContactInfo;
        let mut seen = vec![step];
        while let Some(next) = step.next() {
            step = next;
            seen.push(step);
        }
        assert_eq!(
            seen,
            vec![
                CheckoutStep::ContactInfo,
                CheckoutStep::TicketSelection,
                CheckoutStep::AttendeeDetails,
                CheckoutStep::Payment,
                CheckoutStep::Completed,
            ]
        );
        assert_eq!(CheckoutStep::ContactInfo.prev(), None);
        assert_eq!(CheckoutStep::Completed.prev(), None);
    }

    #[test]
    fn slot_ticket_types_follow_line_order() {
        let selection = TicketSelection {
            lines: vec![
                PricedTicketLine {
                    ticket_type: "General Admission".into(),
                    quantity: 2,
                    unit_price: dec!(95),
                    line_total: dec!(190),
                },
                PricedTicketLine {
                    ticket_type: "VIP".into(),
                    quantity: 1,
                    unit_price: dec!(250),
                    line_total: dec!(250),
                },
            ],
        };
        assert_eq!(selection.subtotal(), dec!(440));
        assert_eq!(selection.total_quantity(), 3);
        assert_eq!(
            selection.slot_ticket_types(),
            vec!["General Admission", "General Admission", "VIP"]
        );
    }

    #[test]
    fn store_purges_idle_sessions() {
        let store = SessionStore::new();
        let mut stale = CheckoutSession::new();
        stale.updated_at = Utc::now() - chrono::Duration::hours(5);
        store.put(stale);
        store.put(CheckoutSession::new());

        let removed = store.purge_idle(chrono::Duration::hours(2), Utc::now());
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn missing_session_is_not_found() {
        let store = SessionStore::new();
        assert!(matches!(
            store.get(Uuid::new_v4()),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn lock_is_exclusive_per_session() {
        let store = SessionStore::new();
        let first = CheckoutSession::new();
        let second = CheckoutSession::new();
        store.put(first.clone());
        store.put(second.clone());

        let guard = store.lock(first.id).await.unwrap();
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), store.lock(first.id))
                .await
                .is_err()
        );
        // Other sessions are unaffected.
        store.lock(second.id).await.unwrap();

        drop(guard);
        store.lock(first.id).await.unwrap();
        assert!(matches!(
            store.lock(Uuid::new_v4()).await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
