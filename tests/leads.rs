mod common;

use chrono::{Duration, Utc};
use sea_orm::{ActiveModelTrait, EntityTrait, PaginatorTrait, Set};
use serde_json::json;
use ticket_checkout::{
    entities::lead::{self, Entity as Lead, LeadStatus},
    services::checkout::session::CheckoutStep,
};

use common::{contact, TestApp};

async fn age_lead(app: &TestApp, email: &str, age: Duration) {
    let lead = app
        .services()
        .leads
        .find_by_email(email)
        .await
        .unwrap()
        .expect("lead exists");
    let mut active: lead::ActiveModel = lead.into();
    active.updated_at = Set(Utc::now() - age);
    active.update(app.db()).await.unwrap();
}

#[tokio::test]
async fn resubmission_updates_the_same_lead() {
    let app = TestApp::new().await;
    let leads = &app.services().leads;

    let first = leads
        .capture_lead(&contact("Ada@Example.com "), Some(json!({"source": "landing"})))
        .await
        .unwrap();
    assert_eq!(first.email, "ada@example.com");
    assert_eq!(first.status, LeadStatus::Contacted);

    let mut changed = contact("ada@example.com");
    changed.phone = "+254711111111".into();
    let second = leads.capture_lead(&changed, None).await.unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.phone, "+254711111111");
    assert_eq!(second.metadata, Some(json!({"source": "landing"})));
    assert_eq!(Lead::find().count(app.db()).await.unwrap(), 1);
}

#[tokio::test]
async fn recent_lead_skips_contact_step() {
    let app = TestApp::new().await;
    let checkout = &app.services().checkout;

    let first = checkout.start_session(None).await.unwrap();
    assert_eq!(first.step, CheckoutStep::ContactInfo);
    checkout
        .submit_contact(first.id, contact("grace@example.com"))
        .await
        .unwrap();

    let next = checkout
        .start_session(Some("GRACE@example.com"))
        .await
        .unwrap();
    assert_eq!(next.step, CheckoutStep::TicketSelection);
    assert!(next.contact_prefilled);
    let prefilled = next.contact.expect("contact prefilled");
    assert_eq!(prefilled.full_name, "Ada Lovelace");
    assert_eq!(prefilled.email, "grace@example.com");
}

#[tokio::test]
async fn stale_lead_shows_contact_step_again() {
    let app = TestApp::new().await;
    let leads = &app.services().leads;
    leads
        .capture_lead(&contact("stale@example.com"), None)
        .await
        .unwrap();
    age_lead(&app, "stale@example.com", Duration::hours(25)).await;

    assert!(!leads
        .is_recent_lead("stale@example.com", Duration::hours(24))
        .await
        .unwrap());

    let session = app
        .services()
        .checkout
        .start_session(Some("stale@example.com"))
        .await
        .unwrap();
    assert_eq!(session.step, CheckoutStep::ContactInfo);
    assert!(session.contact.is_none());
}

#[tokio::test]
async fn unknown_email_starts_at_contact_step() {
    let app = TestApp::new().await;
    let session = app
        .services()
        .checkout
        .start_session(Some("nobody@example.com"))
        .await
        .unwrap();
    assert_eq!(session.step, CheckoutStep::ContactInfo);
    assert!(!session.contact_prefilled);
}

#[tokio::test]
async fn lead_status_follows_checkout_progress() {
    let app = TestApp::new().await;
    app.session_at_payment("progress@example.com", 1).await;

    let lead = app
        .services()
        .leads
        .find_by_email("progress@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lead.status, LeadStatus::AttendeesEntered);

    // Updating a missing lead is a silent no-op.
    app.services()
        .leads
        .update_lead_status("missing@example.com", LeadStatus::Converted)
        .await;
}
