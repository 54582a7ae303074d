pub mod checkout;
pub mod common;
pub mod payment_webhooks;
pub mod promotions;

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::config::AppConfig;
use crate::events::EventSender;
use crate::gateway::{GatewayReadiness, PaymentGateway};
use crate::notifications::ConfirmationNotifier;
use crate::services::{
    checkout::{session::SessionStore, CheckoutService, CheckoutSettings},
    currency::CurrencyResolver,
    leads::LeadService,
    payments::{PaymentOrchestrator, PaymentSettings},
    promotions::PromotionService,
    purchases::{PricingSettings, PurchaseService},
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub checkout: Arc<CheckoutService>,
    pub leads: Arc<LeadService>,
    pub promotions: Arc<PromotionService>,
    pub purchases: Arc<PurchaseService>,
    pub payments: Arc<PaymentOrchestrator>,
}

impl AppServices {
    /// Wires every service over one pool. The gateway, its readiness latch
    /// and the notifier are injected so tests can substitute them.
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: &AppConfig,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        readiness: GatewayReadiness,
        notifier: Arc<dyn ConfirmationNotifier>,
    ) -> Self {
        let leads = Arc::new(LeadService::new(db.clone()));
        let promotions = Arc::new(PromotionService::new(db.clone()));
        let purchases = Arc::new(PurchaseService::new(
            db.clone(),
            event_sender.clone(),
            PricingSettings::from_config(config),
        ));
        let payments = Arc::new(PaymentOrchestrator::new(
            db,
            gateway,
            readiness,
            notifier,
            event_sender.clone(),
            CurrencyResolver::from_config(config),
            PaymentSettings::from_config(config),
        ));
        let checkout = Arc::new(CheckoutService::new(
            Arc::new(SessionStore::new()),
            leads.clone(),
            promotions.clone(),
            purchases.clone(),
            payments.clone(),
            event_sender,
            CheckoutSettings::from_config(config),
        ));

        Self {
            checkout,
            leads,
            promotions,
            purchases,
            payments,
        }
    }
}
