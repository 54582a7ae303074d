#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::DatabaseConnection;
use serde_json::{json, Value};
use ticket_checkout::{
    config::AppConfig,
    db,
    entities::promo_code::{DiscountType, Model as PromoCodeModel},
    events::{self, EventSender},
    gateway::{
        GatewayError, GatewayReadiness, InitializeRequest, InitializeResponse, PaymentGateway,
        Verification,
    },
    handlers::AppServices,
    notifications::{ConfirmationNotifier, ConfirmationPayload, NotificationError},
    services::{
        checkout::session::{AttendeeDetails, AttendeeInput, ContactInfo, TicketLineInput},
        promotions::NewPromoCode,
    },
    AppState,
};
use tokio::sync::{mpsc, Notify};
use tower::ServiceExt;
use uuid::Uuid;

/// How the mock gateway answers `verify`.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyBehaviour {
    /// Charge succeeded for exactly the initialized amount
    Succeed,
    /// Gateway reports the charge as failed
    Decline,
    /// Charge succeeded but for less than was asked
    ShortPay(i64),
    /// Transport failure
    Unavailable,
}

/// Scripted gateway that remembers what was initialized.
pub struct MockGateway {
    behaviour: Mutex<VerifyBehaviour>,
    charges: Mutex<HashMap<String, InitializeRequest>>,
    init_calls: AtomicUsize,
    verify_calls: AtomicUsize,
    held_verify: Mutex<Option<VerifyHold>>,
}

/// Parks the next `verify` call until the test lets it go.
#[derive(Clone, Default)]
pub struct VerifyHold {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            behaviour: Mutex::new(VerifyBehaviour::Succeed),
            charges: Mutex::new(HashMap::new()),
            init_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
            held_verify: Mutex::new(None),
        }
    }

    /// The next `verify` waits for `release` and answers with whatever
    /// behaviour is set at that point.
    pub fn hold_next_verify(&self) -> VerifyHold {
        let hold = VerifyHold::default();
        *self.held_verify.lock().unwrap() = Some(hold.clone());
        hold
    }

    pub fn set_behaviour(&self, behaviour: VerifyBehaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn initialized(&self, reference: &str) -> Option<InitializeRequest> {
        self.charges.lock().unwrap().get(reference).cloned()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn initialize(
        &self,
        request: InitializeRequest,
    ) -> Result<InitializeResponse, GatewayError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        let reference = request.reference.clone();
        self.charges
            .lock()
            .unwrap()
            .insert(reference.clone(), request);
        Ok(InitializeResponse {
            reference: reference.clone(),
            access_code: Some(format!("access-{}", reference)),
            authorization_url: Some(format!("https://checkout.test/{}", reference)),
        })
    }

    async fn verify(&self, reference: &str) -> Result<Verification, GatewayError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        let hold = self.held_verify.lock().unwrap().take();
        if let Some(hold) = hold {
            hold.entered.notify_one();
            hold.release.notified().await;
        }
        let behaviour = self.behaviour.lock().unwrap().clone();
        let charge = self.charges.lock().unwrap().get(reference).cloned();
        let (amount, currency) = charge
            .map(|c| (c.amount_minor, c.currency))
            .unwrap_or((0, "USD".to_string()));

        let (status, amount_minor) = match behaviour {
            VerifyBehaviour::Succeed => ("success", amount),
            VerifyBehaviour::Decline => ("failed", amount),
            VerifyBehaviour::ShortPay(paid) => ("success", paid),
            VerifyBehaviour::Unavailable => {
                return Err(GatewayError::Unavailable("connection reset".into()))
            }
        };

        Ok(Verification {
            reference: reference.to_string(),
            status: status.to_string(),
            amount_minor,
            currency: currency.clone(),
            message: None,
            raw: json!({
                "reference": reference,
                "status": status,
                "amount": amount_minor,
                "currency": currency,
            }),
        })
    }
}

/// Notifier that keeps every payload it is handed.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<ConfirmationPayload>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<ConfirmationPayload> {
        self.sent.lock().unwrap().clone()
    }

    /// Notifications are spawned, so give them a moment to land.
    pub async fn wait_for(&self, count: usize) -> Vec<ConfirmationPayload> {
        for _ in 0..100 {
            if self.sent.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent()
    }
}

#[async_trait]
impl ConfirmationNotifier for RecordingNotifier {
    async fn send_confirmation(
        &self,
        payload: &ConfirmationPayload,
    ) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new("sqlite::memory:", "test");
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;
    cfg
}

/// Application state over a fresh SQLite database.
pub struct TestApp {
    pub state: AppState,
    pub gateway: Arc<MockGateway>,
    pub notifier: Arc<RecordingNotifier>,
    router: Router,
    db_file: Option<PathBuf>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    /// Backed by a temporary database file with a pool of several
    /// connections, so concurrent tasks really hit the database at once.
    pub async fn file_backed() -> Self {
        let path = std::env::temp_dir().join(format!("ticket-checkout-{}.db", Uuid::new_v4()));
        let mut cfg = AppConfig::new(format!("sqlite://{}?mode=rwc", path.display()), "test");
        cfg.db_max_connections = 4;
        cfg.db_min_connections = 1;
        let mut app = Self::with_config(cfg).await;
        app.db_file = Some(path);
        app
    }

    pub async fn with_config(cfg: AppConfig) -> Self {
        Self::with_readiness(cfg, GatewayReadiness::ready()).await
    }

    pub async fn with_readiness(cfg: AppConfig, readiness: GatewayReadiness) -> Self {
        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(MockGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let services = AppServices::new(
            db_arc.clone(),
            &cfg,
            event_sender.clone(),
            gateway.clone(),
            readiness,
            notifier.clone(),
        );

        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            services,
        };
        let router = ticket_checkout::build_router(state.clone());

        Self {
            state,
            gateway,
            notifier,
            router,
            db_file: None,
            _event_task: event_task,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.state.db
    }

    pub fn services(&self) -> &AppServices {
        &self.state.services
    }

    pub async fn seed_promo(
        &self,
        code: &str,
        discount_type: DiscountType,
        value: Decimal,
        usage_limit: Option<i32>,
    ) -> PromoCodeModel {
        self.services()
            .promotions
            .create_promo_code(NewPromoCode {
                code: code.to_string(),
                description: Some(format!("{} test code", code)),
                discount_type,
                discount_value: value,
                minimum_amount: Decimal::ZERO,
                maximum_discount: None,
                usage_limit,
                valid_from: Some(Utc::now() - chrono::Duration::days(1)),
                valid_until: Some(Utc::now() + chrono::Duration::days(30)),
                applicable_ticket_types: vec![],
                applicable_event_id: None,
            })
            .await
            .expect("seed promo code")
    }

    /// Walks a new session up to the payment step.
    pub async fn session_at_payment(&self, email: &str, ga_quantity: u32) -> Uuid {
        let checkout = &self.services().checkout;
        let session = checkout.start_session(None).await.expect("start session");
        checkout
            .submit_contact(session.id, contact(email))
            .await
            .expect("submit contact");
        checkout
            .submit_tickets(session.id, vec![ga_line(ga_quantity)])
            .await
            .expect("submit tickets");
        checkout
            .submit_attendees(session.id, attendee_details(ga_quantity as usize))
            .await
            .expect("submit attendees");
        session.id
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn request_raw(
        &self,
        uri: &str,
        body: Vec<u8>,
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(Method::POST).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder
            .body(Body::from(body))
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
        if let Some(path) = self.db_file.take() {
            let _ = std::fs::remove_file(&path);
            let _ = std::fs::remove_file(path.with_extension("db-journal"));
        }
    }
}

pub async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

pub fn contact(email: &str) -> ContactInfo {
    ContactInfo {
        full_name: "Ada Lovelace".into(),
        email: email.into(),
        phone: "+254700000000".into(),
        country: "Kenya".into(),
    }
}

pub fn ga_line(quantity: u32) -> TicketLineInput {
    TicketLineInput {
        ticket_type: "General Admission".into(),
        quantity,
    }
}

pub fn attendee_details(count: usize) -> AttendeeDetails {
    AttendeeDetails {
        organization: "Analytical Engines".into(),
        is_attending: true,
        terms_accepted: true,
        updates_consent: false,
        attendees: (0..count)
            .map(|i| AttendeeInput {
                full_name: format!("Attendee {}", i + 1),
                email: format!("attendee{}@example.com", i + 1),
                role: "Engineer".into(),
                organization: "Analytical Engines".into(),
            })
            .collect(),
    }
}
