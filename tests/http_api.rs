mod common;

use axum::http::{Method, StatusCode};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use ticket_checkout::{
    entities::promo_code::DiscountType,
    handlers::payment_webhooks::{sign_payload, SIGNATURE_HEADER},
};

use common::{body_json, test_config, TestApp};

fn contact_body(email: &str) -> Value {
    json!({
        "full_name": "Grace Hopper",
        "email": email,
        "phone": "+254700000001",
        "country": "Kenya",
    })
}

fn attendees_body(count: usize) -> Value {
    let attendees: Vec<Value> = (0..count)
        .map(|i| {
            json!({
                "full_name": format!("Guest {}", i + 1),
                "email": format!("guest{}@example.com", i + 1),
                "role": "Speaker",
                "organization": "Navy",
            })
        })
        .collect();
    json!({
        "organization": "Navy",
        "is_attending": true,
        "terms_accepted": true,
        "updates_consent": false,
        "attendees": attendees,
    })
}

async fn new_session(app: &TestApp) -> String {
    let response = app
        .request(Method::POST, "/api/v1/checkout/sessions", None)
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["step"], "contact_info");
    body["data"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_and_status_report_ok() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/api/v1/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["data"]["checks"]["database"], "healthy");

    let response = app.request(Method::GET, "/api/v1/status", None).await;
    let body = body_json(response).await;
    assert_eq!(body["data"]["service"], "ticket-checkout");
    assert_eq!(body["data"]["event_id"], "main-event");
}

#[tokio::test]
async fn ticket_catalog_is_listed() {
    let app = TestApp::new().await;
    let response = app
        .request(Method::GET, "/api/v1/checkout/tickets", None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let names: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["General Admission", "VIP"]);
}

#[tokio::test]
async fn invalid_step_input_returns_field_errors() {
    let app = TestApp::new().await;
    let id = new_session(&app).await;

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/checkout/sessions/{}/contact", id),
            Some(json!({
                "full_name": "",
                "email": "not-an-email",
                "phone": "+254700000001",
                "country": "Kenya",
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert!(body["fields"]["email"].is_string());
    assert!(body["fields"]["full_name"].is_string());
    assert!(body["fields"].get("phone").is_none());

    // The session did not move.
    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/checkout/sessions/{}", id),
            None,
        )
        .await;
    let body = body_json(response).await;
    assert_eq!(body["data"]["step"], "contact_info");
}

#[tokio::test]
async fn walks_a_session_to_a_gateway_charge() {
    let app = TestApp::new().await;
    app.seed_promo("HALF", DiscountType::Percentage, dec!(50), None)
        .await;
    let id = new_session(&app).await;
    let base = format!("/api/v1/checkout/sessions/{}", id);

    let response = app
        .request(
            Method::POST,
            &format!("{}/contact", base),
            Some(contact_body("grace@example.com")),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["step"], "ticket_selection");

    let response = app
        .request(
            Method::POST,
            &format!("{}/tickets", base),
            Some(json!({"tickets": [{"ticket_type": "vip", "quantity": 1}]})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["step"], "attendee_details");
    assert_eq!(body["data"]["tickets"]["lines"][0]["ticket_type"], "VIP");

    let response = app
        .request(
            Method::POST,
            &format!("{}/attendees", base),
            Some(attendees_body(2)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert!(body["fields"]["attendees"].is_string());

    let response = app
        .request(
            Method::POST,
            &format!("{}/attendees", base),
            Some(attendees_body(1)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["step"], "payment");

    let response = app
        .request(
            Method::POST,
            &format!("{}/promo-code", base),
            Some(json!({"code": "NOPE"})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "promo_not_found");

    let response = app
        .request(
            Method::POST,
            &format!("{}/promo-code", base),
            Some(json!({"code": "half"})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["promo"]["code"], "HALF");

    let response = app
        .request(
            Method::POST,
            &format!("{}/payment", base),
            Some(json!({"payment_method": "bank_transfer"})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body_json(response).await["fields"]["invoice_reference"].is_string());

    let response = app
        .request(
            Method::POST,
            &format!("{}/payment", base),
            Some(json!({"payment_method": "card"})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let outcome = &body["data"]["outcome"];
    assert_eq!(outcome["outcome"], "awaiting_payment");
    // 250 less half.
    assert_eq!(outcome["amount_minor"], 12500);
    let reference = outcome["reference"].as_str().unwrap().to_string();

    let response = app
        .request(
            Method::POST,
            &format!("{}/settlement", base),
            Some(json!({"result": "success", "reference": reference})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["step"], "completed");
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let app = TestApp::new().await;
    let response = app
        .request(
            Method::GET,
            "/api/v1/checkout/sessions/00000000-0000-0000-0000-000000000000",
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Not Found");
}

#[tokio::test]
async fn promo_validation_endpoint_prices_the_selection() {
    let app = TestApp::new().await;
    app.seed_promo("TEN", DiscountType::Fixed, dec!(10), None)
        .await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/promo-codes/validate",
            Some(json!({
                "code": "ten",
                "tickets": [{"ticket_type": "General Admission", "quantity": 2}],
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["discount"]["code"], "TEN");

    let response = app
        .request(
            Method::POST,
            "/api/v1/promo-codes/validate",
            Some(json!({
                "code": "ten",
                "tickets": [{"ticket_type": "Backstage", "quantity": 1}],
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert!(body["fields"]["tickets[0].ticket_type"].is_string());
}

#[tokio::test]
async fn webhook_requires_a_valid_signature_when_configured() {
    let mut cfg = test_config();
    cfg.payment_gateway.webhook_secret = Some("whsec_test".into());
    let app = TestApp::with_config(cfg).await;
    let session_id = app.session_at_payment("signed@example.com", 1).await;
    let submission = app
        .services()
        .checkout
        .submit_payment(
            session_id,
            ticket_checkout::services::checkout::session::PaymentDetails {
                payment_method: ticket_checkout::entities::purchase::PaymentMethod::Card,
                invoice_reference: None,
            },
        )
        .await
        .unwrap();
    let reference = match submission.outcome {
        ticket_checkout::services::payments::SettlementOutcome::AwaitingPayment(h) => h.reference,
        other => panic!("unexpected outcome {:?}", other),
    };

    let payload = serde_json::to_vec(&json!({
        "event": "charge.success",
        "data": {"reference": reference},
    }))
    .unwrap();

    let response = app
        .request_raw(
            "/api/v1/payments/webhook",
            payload.clone(),
            &[(SIGNATURE_HEADER, "deadbeef")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .request_raw("/api/v1/payments/webhook", payload.clone(), &[])
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let signature = sign_payload("whsec_test", &payload).unwrap();
    let response = app
        .request_raw(
            "/api/v1/payments/webhook",
            payload,
            &[(SIGNATURE_HEADER, signature.as_str())],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let purchase = app
        .services()
        .payments
        .find_by_reference(&reference)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        purchase.status,
        ticket_checkout::entities::purchase::PurchaseStatus::Paid
    );

    let garbage = b"{not json".to_vec();
    let signature = sign_payload("whsec_test", &garbage).unwrap();
    let response = app
        .request_raw(
            "/api/v1/payments/webhook",
            garbage,
            &[(SIGNATURE_HEADER, signature.as_str())],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unsigned_webhooks_are_accepted_without_a_secret() {
    let app = TestApp::new().await;
    let payload = serde_json::to_vec(&json!({
        "event": "charge.success",
        "data": {"reference": "TKT-0-NOBODY"},
    }))
    .unwrap();
    let response = app
        .request_raw("/api/v1/payments/webhook", payload, &[])
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}
