use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, instrument, warn};

use super::{GatewayError, InitializeRequest, InitializeResponse, PaymentGateway, Verification};
use crate::config::PaymentGatewayConfig;

/// Every gateway response is wrapped in this envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    status: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    reference: Option<String>,
    access_code: Option<String>,
    authorization_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    reference: String,
    status: String,
    amount: i64,
    currency: String,
    #[serde(default)]
    gateway_response: Option<String>,
}

/// REST client for a Paystack-style gateway.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    secret_key: String,
}

impl HttpPaymentGateway {
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        })
    }

    pub fn from_config(config: &PaymentGatewayConfig) -> Result<Self, GatewayError> {
        let secret_key = config.secret_key.clone().ok_or_else(|| {
            GatewayError::Unavailable("payment gateway secret key is not configured".to_string())
        })?;
        Self::new(config.base_url.clone(), secret_key)
    }

    async fn read_envelope(response: reqwest::Response) -> Result<JsonValue, GatewayError> {
        let status = response.status();
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

        if !envelope.status {
            let message = envelope
                .message
                .unwrap_or_else(|| format!("request failed with HTTP {}", status));
            return Err(if status.is_server_error() {
                GatewayError::Unavailable(message)
            } else {
                GatewayError::Rejected(message)
            });
        }

        envelope
            .data
            .ok_or_else(|| GatewayError::InvalidResponse("response has no data".to_string()))
    }
}

fn transport_error(operation: &'static str, err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(operation)
    } else {
        GatewayError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, request), fields(reference = %request.reference))]
    async fn initialize(
        &self,
        request: InitializeRequest,
    ) -> Result<InitializeResponse, GatewayError> {
        let mut body = json!({
            "reference": request.reference,
            "amount": request.amount_minor,
            "currency": request.currency,
            "email": request.email,
            "metadata": request.metadata,
        });
        if let Some(callback_url) = &request.callback_url {
            body["callback_url"] = json!(callback_url);
        }

        let response = self
            .client
            .post(format!("{}/transaction/initialize", self.base_url))
            .bearer_auth(&self.secret_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("initialize", e))?;

        let data = Self::read_envelope(response).await?;
        let data: InitializeData = serde_json::from_value(data)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

        debug!("gateway transaction initialized");
        Ok(InitializeResponse {
            reference: data.reference.unwrap_or(request.reference),
            access_code: data.access_code,
            authorization_url: data.authorization_url,
        })
    }

    #[instrument(skip(self))]
    async fn verify(&self, reference: &str) -> Result<Verification, GatewayError> {
        let response = self
            .client
            .get(format!("{}/transaction/verify/{}", self.base_url, reference))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| transport_error("verify", e))?;

        if response.status() == StatusCode::NOT_FOUND {
            warn!(%reference, "gateway does not know this reference");
        }

        let raw = Self::read_envelope(response).await?;
        let data: VerifyData = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

        Ok(Verification {
            reference: data.reference,
            status: data.status,
            amount_minor: data.amount,
            currency: data.currency,
            message: data.gateway_response,
            raw,
        })
    }
}
