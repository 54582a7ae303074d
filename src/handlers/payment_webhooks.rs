use axum::{extract::State, http::HeaderMap, http::StatusCode, response::IntoResponse};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use tracing::{info, warn};

use crate::{
    errors::ServiceError,
    services::payments::{GatewayWebhookEvent, WebhookOutcome},
    AppState,
};

type HmacSha512 = Hmac<Sha512>;

pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

// POST /api/v1/payments/webhook
//
// Always answers 200 once the payload is authenticated and parsed, whatever
// the settlement outcome; the gateway would otherwise keep redelivering.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    if let Some(secret) = state.config.payment_gateway.webhook_secret.as_deref() {
        if !verify_signature(&headers, &body, secret) {
            warn!("Payment webhook signature verification failed");
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }
    }

    let event: GatewayWebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid json: {}", e)))?;

    match state.services.payments.handle_webhook(event).await {
        Ok(WebhookOutcome::Completed(completion)) => {
            info!(purchase_id = %completion.purchase_id, status = ?completion.status, "webhook settled purchase");
        }
        Ok(WebhookOutcome::MarkedFailed(purchase_id)) => {
            info!(%purchase_id, "webhook marked purchase failed");
        }
        Ok(WebhookOutcome::Ignored(reason)) => {
            info!(%reason, "webhook ignored");
        }
        Err(e) => {
            warn!(error = %e, "webhook processing failed");
        }
    }

    Ok((StatusCode::OK, "ok"))
}

/// Hex HMAC-SHA512 of the raw body.
pub fn sign_payload(secret: &str, payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

fn verify_signature(headers: &HeaderMap, payload: &[u8], secret: &str) -> bool {
    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    match sign_payload(secret, payload) {
        Some(expected) => constant_time_eq(&expected, &signature.trim().to_ascii_lowercase()),
        None => false,
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn accepts_matching_signature_only() {
        let body = br#"{"event":"charge.success","data":{"reference":"TKT-1"}}"#;
        let signature = sign_payload("whsec", body).unwrap();
        assert_eq!(signature.len(), 128);

        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&signature).unwrap());
        assert!(verify_signature(&headers, body, "whsec"));
        assert!(!verify_signature(&headers, body, "other"));
        assert!(!verify_signature(&headers, b"tampered", "whsec"));
        assert!(!verify_signature(&HeaderMap::new(), body, "whsec"));
    }
}
