use axum::{extract::State, response::Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    services::{
        checkout::{session::TicketLineInput, validation::price_selection},
        promotions::DiscountResult,
        purchases::PriceBreakdown,
    },
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Deserialize)]
pub struct ValidatePromoCodeRequest {
    pub code: String,
    pub tickets: Vec<TicketLineInput>,
}

#[derive(Debug, Serialize)]
pub struct ValidatePromoCodeResponse {
    pub discount: DiscountResult,
    pub totals: PriceBreakdown,
}

// POST /api/v1/promo-codes/validate
pub async fn validate_promo_code(
    State(state): State<AppState>,
    Json(payload): Json<ValidatePromoCodeRequest>,
) -> ApiResult<ValidatePromoCodeResponse> {
    let selection = price_selection(&payload.tickets, &state.config.tickets)?;
    let candidate = state.services.purchases.candidate_for(&selection);

    let discount = state
        .services
        .promotions
        .validate(&payload.code, &candidate, Utc::now())
        .await?;
    let totals = PriceBreakdown::compute(candidate.total, discount.amount, state.config.tax_rate);

    Ok(Json(ApiResponse::success(ValidatePromoCodeResponse {
        discount,
        totals,
    })))
}
