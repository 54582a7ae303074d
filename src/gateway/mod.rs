//! Payment gateway seam.
//!
//! The orchestrator only talks to [`PaymentGateway`]. Production wires in
//! [`http::HttpPaymentGateway`]; tests script their own implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod http;
pub mod readiness;

pub use http::HttpPaymentGateway;
pub use readiness::{GatewayReadiness, ReadySignal};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Gateway {0} timed out")]
    Timeout(&'static str),
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
    #[error("Gateway rejected the request: {0}")]
    Rejected(String),
    #[error("Unexpected gateway response: {0}")]
    InvalidResponse(String),
    #[error("Gateway never became ready")]
    NotReady,
}

/// Everything the gateway needs to open a charge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeRequest {
    pub reference: String,
    /// Amount in minor units of `currency`
    pub amount_minor: i64,
    pub currency: String,
    pub email: String,
    pub callback_url: Option<String>,
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeResponse {
    pub reference: String,
    pub access_code: Option<String>,
    pub authorization_url: Option<String>,
}

/// Result of looking a reference up on the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub reference: String,
    /// Gateway status string, "success" when the charge went through
    pub status: String,
    pub amount_minor: i64,
    pub currency: String,
    pub message: Option<String>,
    pub raw: JsonValue,
}

impl Verification {
    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success")
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initialize(&self, request: InitializeRequest)
        -> Result<InitializeResponse, GatewayError>;

    async fn verify(&self, reference: &str) -> Result<Verification, GatewayError>;
}
