use std::collections::BTreeMap;
use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};

use crate::gateway::GatewayError;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Body returned for every failed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g. "Not Found", "Unprocessable Entity")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Machine-readable code for promo-code and payment failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Field-keyed validation messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<FieldErrors>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error was produced
    pub timestamp: String,
}

/// Field-keyed validation messages, ordered by field name.
///
/// Keys are form field names (`email`, `tickets[0].quantity`,
/// `attendees[1].email`). Only the first message recorded for a field is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, String>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_insert_with(|| message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// `Ok(())` when nothing was recorded, otherwise a `ValidationError`.
    pub fn into_result(self) -> Result<(), ServiceError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::ValidationError(self))
        }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, message) in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", field, message)?;
            first = false;
        }
        Ok(())
    }
}

impl From<validator::ValidationErrors> for FieldErrors {
    fn from(err: validator::ValidationErrors) -> Self {
        let mut fields = FieldErrors::new();
        for (field, errors) in err.field_errors() {
            for error in errors.iter() {
                let message = error
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("{} is invalid", field));
                fields.add(field, message);
            }
        }
        fields
    }
}

/// Reasons a promo code cannot be applied. Surfaced to the buyer verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromoCodeError {
    #[error("Promo code {0} was not found")]
    NotFound(String),

    #[error("Promo code {0} is not active yet")]
    NotYetActive(String),

    #[error("Promo code {0} has expired")]
    Expired(String),

    #[error("Promo code {0} has reached its usage limit")]
    UsageLimitExceeded(String),

    #[error("Promo code {0} does not apply to the selected tickets")]
    NotApplicable(String),

    #[error("Promo code {code} requires a minimum purchase of {minimum}")]
    MinimumNotMet { code: String, minimum: Decimal },
}

impl PromoCodeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "promo_not_found",
            Self::NotYetActive(_) => "promo_not_yet_active",
            Self::Expired(_) => "promo_expired",
            Self::UsageLimitExceeded(_) => "promo_usage_limit_exceeded",
            Self::NotApplicable(_) => "promo_not_applicable",
            Self::MinimumNotMet { .. } => "promo_minimum_not_met",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    PersistenceError(#[from] DbErr),

    #[error("Validation error: {0}")]
    ValidationError(FieldErrors),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    PromoCode(#[from] PromoCodeError),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Payment gateway error: {0}")]
    GatewayError(#[from] GatewayError),

    #[error("Payment verification failed: {0}")]
    VerificationFailed(String),

    #[error("Payment cancelled: {0}")]
    PaymentCancelled(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.into())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ServiceError::ValidationError(FieldErrors::single(field, message))
    }

    /// Field map carried by a validation failure, if any.
    pub fn field_errors(&self) -> Option<&FieldErrors> {
        match self {
            Self::ValidationError(fields) => Some(fields),
            _ => None,
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::PersistenceError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidAmount(_) | Self::InvalidOperation(_) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PromoCode(PromoCodeError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::PromoCode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::GatewayError(_) => StatusCode::BAD_GATEWAY,
            Self::VerificationFailed(_) => StatusCode::PAYMENT_REQUIRED,
            Self::PaymentCancelled(_) | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::PersistenceError(_) => {
                "We could not save your order right now, please try again".to_string()
            }
            Self::SerializationError(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            Self::GatewayError(_) => {
                "The payment provider is unavailable, please try again".to_string()
            }
            Self::ValidationError(_) => "Some fields need attention".to_string(),
            Self::PromoCode(err) => err.to_string(),
            _ => self.to_string(),
        }
    }

    /// Machine-readable code for the failures a client is expected to branch on.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::PromoCode(err) => Some(err.code()),
            Self::VerificationFailed(_) => Some("verification_failed"),
            Self::PaymentCancelled(_) => Some("payment_cancelled"),
            Self::GatewayError(_) => Some("gateway_unavailable"),
            Self::InvalidAmount(_) => Some("invalid_amount"),
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let fields = match &self {
            Self::ValidationError(fields) => Some(fields.clone()),
            _ => None,
        };

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            code: self.error_code().map(str::to_string),
            fields,
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
