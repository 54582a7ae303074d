use assert_matches::assert_matches;
use serde_json::json;
use ticket_checkout::{
    config::PaymentGatewayConfig,
    gateway::{GatewayError, HttpPaymentGateway, InitializeRequest, PaymentGateway},
};
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn init_request() -> InitializeRequest {
    InitializeRequest {
        reference: "TKT-1700000000000-ABCD1234".into(),
        amount_minor: 15200,
        currency: "USD".into(),
        email: "buyer@example.com".into(),
        callback_url: Some("https://tickets.test/return".into()),
        metadata: json!({"attendee_count": 2}),
    }
}

#[tokio::test]
async fn initialize_posts_the_charge_with_bearer_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transaction/initialize"))
        .and(header("authorization", "Bearer sk_test_123"))
        .and(body_partial_json(json!({
            "reference": "TKT-1700000000000-ABCD1234",
            "amount": 15200,
            "currency": "USD",
            "email": "buyer@example.com",
            "callback_url": "https://tickets.test/return",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "Authorization URL created",
            "data": {
                "reference": "TKT-1700000000000-ABCD1234",
                "access_code": "ac_987",
                "authorization_url": "https://checkout.gateway.test/ac_987",
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = HttpPaymentGateway::new(format!("{}/", server.uri()), "sk_test_123").unwrap();
    let response = gateway.initialize(init_request()).await.unwrap();

    assert_eq!(response.reference, "TKT-1700000000000-ABCD1234");
    assert_eq!(response.access_code.as_deref(), Some("ac_987"));
    assert_eq!(
        response.authorization_url.as_deref(),
        Some("https://checkout.gateway.test/ac_987")
    );
}

#[tokio::test]
async fn verify_reads_status_amount_and_currency() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/TKT-1-XYZ"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "Verification successful",
            "data": {
                "reference": "TKT-1-XYZ",
                "status": "success",
                "amount": 1976000,
                "currency": "KES",
                "gateway_response": "Approved",
            }
        })))
        .mount(&server)
        .await;

    let gateway = HttpPaymentGateway::new(server.uri(), "sk_test_123").unwrap();
    let verification = gateway.verify("TKT-1-XYZ").await.unwrap();

    assert!(verification.is_success());
    assert_eq!(verification.amount_minor, 1_976_000);
    assert_eq!(verification.currency, "KES");
    assert_eq!(verification.message.as_deref(), Some("Approved"));
    assert_eq!(verification.raw["reference"], "TKT-1-XYZ");
}

#[tokio::test]
async fn failed_envelopes_map_to_rejected_or_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transaction/initialize"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "status": false,
            "message": "Invalid email address",
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/TKT-DOWN"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "status": false,
            "message": "Service temporarily unavailable",
        })))
        .mount(&server)
        .await;

    let gateway = HttpPaymentGateway::new(server.uri(), "sk_test_123").unwrap();

    let err = gateway.initialize(init_request()).await.unwrap_err();
    assert_eq!(err, GatewayError::Rejected("Invalid email address".into()));

    let err = gateway.verify("TKT-DOWN").await.unwrap_err();
    assert_matches!(err, GatewayError::Unavailable(message) if message.contains("temporarily"));
}

#[tokio::test]
async fn malformed_bodies_are_invalid_responses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/TKT-ODD"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway maintenance</html>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/TKT-EMPTY"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": true})))
        .mount(&server)
        .await;

    let gateway = HttpPaymentGateway::new(server.uri(), "sk_test_123").unwrap();
    assert_matches!(
        gateway.verify("TKT-ODD").await,
        Err(GatewayError::InvalidResponse(_))
    );
    assert_matches!(
        gateway.verify("TKT-EMPTY").await,
        Err(GatewayError::InvalidResponse(_))
    );
}

#[test]
fn missing_secret_key_is_a_configuration_error() {
    let config = PaymentGatewayConfig::default();
    assert_matches!(
        HttpPaymentGateway::from_config(&config).err(),
        Some(GatewayError::Unavailable(_))
    );
}
