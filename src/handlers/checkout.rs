use axum::{
    extract::{Path, State},
    response::{Json, Response},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    services::{
        checkout::{
            session::{AttendeeDetails, CheckoutSession, ContactInfo, PaymentDetails, TicketLineInput},
            PaymentSubmission,
        },
        payments::ClientCallback,
    },
    ApiResponse, ApiResult, AppState,
};

use super::common::created_response;

#[derive(Debug, Default, Deserialize)]
pub struct StartSessionRequest {
    /// Email remembered by the client from an earlier visit
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TicketsRequest {
    pub tickets: Vec<TicketLineInput>,
}

#[derive(Debug, Deserialize)]
pub struct PromoCodeRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct TicketOption {
    pub name: String,
    pub price: rust_decimal::Decimal,
}

// POST /api/v1/checkout/sessions
pub async fn start_session(
    State(state): State<AppState>,
    body: Option<Json<StartSessionRequest>>,
) -> Result<Response, ServiceError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let session = state
        .services
        .checkout
        .start_session(request.email.as_deref())
        .await?;
    Ok(created_response(session))
}

// GET /api/v1/checkout/sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<CheckoutSession> {
    let session = state.services.checkout.get_session(id)?;
    Ok(Json(ApiResponse::success(session)))
}

// GET /api/v1/checkout/tickets
pub async fn list_ticket_types(State(state): State<AppState>) -> ApiResult<Vec<TicketOption>> {
    let options = state
        .services
        .checkout
        .catalog()
        .iter()
        .map(|t| TicketOption {
            name: t.name.clone(),
            price: t.price,
        })
        .collect();
    Ok(Json(ApiResponse::success(options)))
}

pub async fn submit_contact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(contact): Json<ContactInfo>,
) -> ApiResult<CheckoutSession> {
    let session = state.services.checkout.submit_contact(id, contact).await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn submit_tickets(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TicketsRequest>,
) -> ApiResult<CheckoutSession> {
    let session = state
        .services
        .checkout
        .submit_tickets(id, payload.tickets)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn submit_attendees(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(details): Json<AttendeeDetails>,
) -> ApiResult<CheckoutSession> {
    let session = state
        .services
        .checkout
        .submit_attendees(id, details)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn apply_promo_code(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<PromoCodeRequest>,
) -> ApiResult<CheckoutSession> {
    let session = state
        .services
        .checkout
        .apply_promo_code(id, &payload.code)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn submit_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payment): Json<PaymentDetails>,
) -> ApiResult<PaymentSubmission> {
    let submission = state.services.checkout.submit_payment(id, payment).await?;
    Ok(Json(ApiResponse::success(submission)))
}

pub async fn settlement_callback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(callback): Json<ClientCallback>,
) -> ApiResult<CheckoutSession> {
    let session = state
        .services
        .checkout
        .handle_settlement_callback(id, callback)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn go_back(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<CheckoutSession> {
    let session = state.services.checkout.prev(id).await?;
    Ok(Json(ApiResponse::success(session)))
}
