//! Purchase confirmation delivery.
//!
//! Notifications are fire-and-forget: the orchestrator spawns them after the
//! payment commits and only logs a failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::NotificationConfig;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-relay-signature";

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Delivery failed after {attempts} attempts: {reason}")]
    DeliveryFailed { attempts: u32, reason: String },
    #[error("Notifier misconfigured: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketSummary {
    pub ticket_type: String,
    pub quantity: i32,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendeeSummary {
    pub full_name: String,
    pub email: String,
    pub ticket_type: String,
}

/// What a purchaser receives once payment is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationPayload {
    pub purchase_id: Uuid,
    pub purchaser_name: String,
    pub purchaser_email: String,
    pub organization: Option<String>,
    pub tickets: Vec<TicketSummary>,
    pub attendees: Vec<AttendeeSummary>,
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub tax_amount: Decimal,
    pub final_amount: Decimal,
    pub currency: String,
    pub payment_method: String,
    pub payment_reference: String,
    pub promo_code: Option<String>,
    pub paid_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConfirmationNotifier: Send + Sync {
    async fn send_confirmation(&self, payload: &ConfirmationPayload)
        -> Result<(), NotificationError>;
}

/// Runs `notifier` in the background. The result is only logged.
pub fn dispatch(notifier: Arc<dyn ConfirmationNotifier>, payload: ConfirmationPayload) {
    tokio::spawn(async move {
        if let Err(e) = notifier.send_confirmation(&payload).await {
            error!(
                purchase_id = %payload.purchase_id,
                error = %e,
                "confirmation notification failed"
            );
        }
    });
}

/// Fallback used when no relay is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl ConfirmationNotifier for LogNotifier {
    async fn send_confirmation(
        &self,
        payload: &ConfirmationPayload,
    ) -> Result<(), NotificationError> {
        info!(
            purchase_id = %payload.purchase_id,
            email = %payload.purchaser_email,
            reference = %payload.payment_reference,
            amount = %payload.final_amount,
            "purchase confirmed"
        );
        Ok(())
    }
}

/// Posts confirmations to a mail relay, retrying with exponential backoff.
#[derive(Clone)]
pub struct WebhookEmailNotifier {
    client: reqwest::Client,
    relay_url: String,
    signing_secret: Option<String>,
    max_retries: u32,
    base_backoff: Duration,
}

impl WebhookEmailNotifier {
    pub fn new(
        relay_url: impl Into<String>,
        signing_secret: Option<String>,
        max_retries: u32,
    ) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotificationError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            relay_url: relay_url.into(),
            signing_secret,
            max_retries: max_retries.max(1),
            base_backoff: Duration::from_secs(1),
        })
    }

    pub fn with_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    pub fn sign(secret: &str, body: &[u8]) -> Result<String, NotificationError> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| NotificationError::Configuration(e.to_string()))?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl ConfirmationNotifier for WebhookEmailNotifier {
    #[instrument(skip(self, payload), fields(purchase_id = %payload.purchase_id))]
    async fn send_confirmation(
        &self,
        payload: &ConfirmationPayload,
    ) -> Result<(), NotificationError> {
        let body = serde_json::to_vec(payload)?;
        let signature = match &self.signing_secret {
            Some(secret) => Some(Self::sign(secret, &body)?),
            None => None,
        };

        let mut last_error = String::new();
        for attempt in 1..=self.max_retries {
            let mut request = self
                .client
                .post(&self.relay_url)
                .header("Content-Type", "application/json")
                .body(body.clone());
            if let Some(sig) = &signature {
                request = request.header(SIGNATURE_HEADER, sig);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!(attempt, "confirmation delivered");
                    return Ok(());
                }
                Ok(response) => {
                    last_error = format!("relay answered {}", response.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            warn!(
                attempt,
                max_retries = self.max_retries,
                error = %last_error,
                "confirmation delivery attempt failed"
            );

            if attempt < self.max_retries {
                tokio::time::sleep(self.base_backoff * 2_u32.pow(attempt - 1)).await;
            }
        }

        Err(NotificationError::DeliveryFailed {
            attempts: self.max_retries,
            reason: last_error,
        })
    }
}

/// Relay notifier when a relay URL is configured, log notifier otherwise.
pub fn from_config(
    config: &NotificationConfig,
) -> Result<Arc<dyn ConfirmationNotifier>, NotificationError> {
    match &config.relay_url {
        Some(url) => Ok(Arc::new(WebhookEmailNotifier::new(
            url.clone(),
            config.signing_secret.clone(),
            config.max_retries,
        )?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}
