use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Condition, Expr},
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set, SqlErr,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    entities::promo_code::{self, DiscountType, Entity as PromoCode, Model as PromoCodeModel},
    errors::{PromoCodeError, ServiceError},
    services::currency::round_money,
};

/// Codes are matched case-insensitively and stored upper-cased.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// What the buyer is about to pay for, as seen by the discount engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateSelection {
    pub ticket_types: Vec<String>,
    pub event_id: Option<String>,
    /// Pre-discount total in the canonical currency
    pub total: Decimal,
}

/// A validated discount, ready to be applied to an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountResult {
    pub amount: Decimal,
    pub promo_code_id: Uuid,
    pub code: String,
    pub description: Option<String>,
}

/// Input for creating a promo code.
#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_new_promo_code", skip_on_field_errors = false))]
pub struct NewPromoCode {
    #[validate(length(min = 1, max = 64, message = "Code must be 1-64 characters"))]
    pub code: String,
    pub description: Option<String>,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    #[serde(default)]
    pub minimum_amount: Decimal,
    pub maximum_discount: Option<Decimal>,
    #[validate(range(min = 1, message = "Usage limit must be at least 1"))]
    pub usage_limit: Option<i32>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub applicable_ticket_types: Vec<String>,
    pub applicable_event_id: Option<String>,
}

fn validate_new_promo_code(input: &NewPromoCode) -> Result<(), ValidationError> {
    let invalid = |code: &'static str, message: &'static str| {
        let mut err = ValidationError::new(code);
        err.message = Some(message.into());
        Err(err)
    };

    if input.code.trim().is_empty() {
        return invalid("code_blank", "Code must not be blank");
    }
    if input.discount_value <= Decimal::ZERO {
        return invalid("discount_value", "Discount value must be positive");
    }
    if input.discount_type == DiscountType::Percentage && input.discount_value > Decimal::ONE_HUNDRED
    {
        return invalid("discount_value", "Percentage discounts cannot exceed 100");
    }
    if input.minimum_amount < Decimal::ZERO {
        return invalid("minimum_amount", "Minimum amount cannot be negative");
    }
    if matches!(input.maximum_discount, Some(cap) if cap <= Decimal::ZERO) {
        return invalid("maximum_discount", "Maximum discount must be positive");
    }
    if let (Some(from), Some(until)) = (input.valid_from, input.valid_until) {
        if until <= from {
            return invalid("valid_until", "Validity window ends before it starts");
        }
    }
    Ok(())
}

/// Checks a code against the selection and computes the bounded discount.
///
/// Checks run in a fixed order and stop at the first failure: activity,
/// validity window, usage cap, applicability, minimum spend.
pub fn evaluate(
    promo: &PromoCodeModel,
    selection: &CandidateSelection,
    now: DateTime<Utc>,
) -> Result<DiscountResult, PromoCodeError> {
    if !promo.is_active {
        return Err(PromoCodeError::NotFound(promo.code.clone()));
    }

    if now < promo.valid_from {
        return Err(PromoCodeError::NotYetActive(promo.code.clone()));
    }
    if matches!(promo.valid_until, Some(until) if now > until) {
        return Err(PromoCodeError::Expired(promo.code.clone()));
    }

    if matches!(promo.usage_limit, Some(limit) if promo.used_count >= limit) {
        return Err(PromoCodeError::UsageLimitExceeded(promo.code.clone()));
    }

    if promo.has_applicability_filter() && !applies_to(promo, selection) {
        return Err(PromoCodeError::NotApplicable(promo.code.clone()));
    }

    if selection.total < promo.minimum_amount {
        return Err(PromoCodeError::MinimumNotMet {
            code: promo.code.clone(),
            minimum: promo.minimum_amount,
        });
    }

    Ok(DiscountResult {
        amount: discount_amount(promo, selection.total),
        promo_code_id: promo.id,
        code: promo.code.clone(),
        description: promo.description.clone(),
    })
}

fn applies_to(promo: &PromoCodeModel, selection: &CandidateSelection) -> bool {
    let ticket_filter = promo.ticket_type_filter();
    let ticket_match = selection.ticket_types.iter().any(|selected| {
        ticket_filter
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(selected.trim()))
    });

    let event_match = match (&promo.applicable_event_id, &selection.event_id) {
        (Some(required), Some(selected)) => required == selected,
        _ => false,
    };

    ticket_match || event_match
}

/// Discount before any eligibility checks: capped, never above `total`.
pub fn discount_amount(promo: &PromoCodeModel, total: Decimal) -> Decimal {
    let raw = match promo.discount_type {
        DiscountType::Percentage => total * promo.discount_value / Decimal::ONE_HUNDRED,
        DiscountType::Fixed => promo.discount_value,
    };

    let capped = match promo.maximum_discount {
        Some(cap) => raw.min(cap),
        None => raw,
    };

    round_money(capped.min(total).max(Decimal::ZERO))
}

#[derive(Clone)]
pub struct PromotionService {
    db: Arc<DatabaseConnection>,
}

impl PromotionService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find an active promo code by its normalized value.
    pub async fn find_active<C: ConnectionTrait>(
        conn: &C,
        code: &str,
    ) -> Result<Option<PromoCodeModel>, ServiceError> {
        let promo = PromoCode::find()
            .filter(promo_code::Column::Code.eq(normalize_code(code)))
            .filter(promo_code::Column::IsActive.eq(true))
            .one(conn)
            .await?;
        Ok(promo)
    }

    /// Validates `code` against the selection without consuming a use.
    #[instrument(skip(self, selection), fields(total = %selection.total))]
    pub async fn validate(
        &self,
        code: &str,
        selection: &CandidateSelection,
        now: DateTime<Utc>,
    ) -> Result<DiscountResult, ServiceError> {
        Self::validate_on(&*self.db, code, selection, now).await
    }

    /// Same as [`PromotionService::validate`], on a caller-supplied
    /// connection or transaction.
    pub async fn validate_on<C: ConnectionTrait>(
        conn: &C,
        code: &str,
        selection: &CandidateSelection,
        now: DateTime<Utc>,
    ) -> Result<DiscountResult, ServiceError> {
        let normalized = normalize_code(code);
        if normalized.is_empty() {
            return Err(ServiceError::validation("promo_code", "Enter a promo code"));
        }

        let promo = Self::find_active(conn, &normalized)
            .await?
            .ok_or_else(|| PromoCodeError::NotFound(normalized.clone()))?;

        let result = evaluate(&promo, selection, now).map_err(|e| {
            debug!(code = %normalized, reason = e.code(), "promo code rejected");
            e
        })?;

        Ok(result)
    }

    /// Consumes one use of the code.
    #[instrument(skip(self))]
    pub async fn commit_usage(&self, promo_code_id: Uuid) -> Result<(), ServiceError> {
        Self::commit_usage_on(&*self.db, promo_code_id).await
    }

    /// Atomic conditional increment. The row is only touched while
    /// `used_count < usage_limit` (or no limit is set), so concurrent callers
    /// can never push the count past the limit.
    pub async fn commit_usage_on<C: ConnectionTrait>(
        conn: &C,
        promo_code_id: Uuid,
    ) -> Result<(), ServiceError> {
        let result = PromoCode::update_many()
            .col_expr(
                promo_code::Column::UsedCount,
                Expr::col(promo_code::Column::UsedCount).add(1),
            )
            .col_expr(promo_code::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(promo_code::Column::Id.eq(promo_code_id))
            .filter(
                Condition::any()
                    .add(promo_code::Column::UsageLimit.is_null())
                    .add(
                        Expr::col(promo_code::Column::UsedCount)
                            .lt(Expr::col(promo_code::Column::UsageLimit)),
                    ),
            )
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            let promo = PromoCode::find_by_id(promo_code_id)
                .one(conn)
                .await?
                .ok_or_else(|| PromoCodeError::NotFound(promo_code_id.to_string()))?;
            warn!(code = %promo.code, "promo code usage limit reached");
            return Err(PromoCodeError::UsageLimitExceeded(promo.code).into());
        }

        counter!("checkout_promo_redemptions_total", 1);
        Ok(())
    }

    pub async fn find_by_code(&self, code: &str) -> Result<PromoCodeModel, ServiceError> {
        let normalized = normalize_code(code);
        PromoCode::find()
            .filter(promo_code::Column::Code.eq(normalized.clone()))
            .one(&*self.db)
            .await?
            .ok_or_else(|| PromoCodeError::NotFound(normalized).into())
    }

    pub async fn list_promo_codes(&self) -> Result<Vec<PromoCodeModel>, ServiceError> {
        let codes = PromoCode::find()
            .order_by_asc(promo_code::Column::Code)
            .all(&*self.db)
            .await?;
        Ok(codes)
    }

    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create_promo_code(
        &self,
        input: NewPromoCode,
    ) -> Result<PromoCodeModel, ServiceError> {
        input.validate()?;

        let now = Utc::now();
        let code = normalize_code(&input.code);
        let ticket_types = if input.applicable_ticket_types.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&input.applicable_ticket_types)?)
        };

        let model = promo_code::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.clone()),
            description: Set(input.description),
            discount_type: Set(input.discount_type),
            discount_value: Set(input.discount_value),
            minimum_amount: Set(input.minimum_amount),
            maximum_discount: Set(input.maximum_discount),
            usage_limit: Set(input.usage_limit),
            used_count: Set(0),
            valid_from: Set(input.valid_from.unwrap_or(now)),
            valid_until: Set(input.valid_until),
            applicable_ticket_types: Set(ticket_types),
            applicable_event_id: Set(input.applicable_event_id),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match model.insert(&*self.db).await {
            Ok(created) => {
                info!(code = %created.code, "promo code created");
                Ok(created)
            }
            Err(err) if is_unique_violation(&err) => Err(ServiceError::Conflict(format!(
                "Promo code {} already exists",
                code
            ))),
            Err(err) => Err(err.into()),
        }
    }

    /// Codes are never deleted; deactivation hides them from validation.
    #[instrument(skip(self))]
    pub async fn deactivate_promo_code(&self, code: &str) -> Result<PromoCodeModel, ServiceError> {
        let existing = self.find_by_code(code).await?;
        let mut active: promo_code::ActiveModel = existing.into();
        active.is_active = Set(false);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&*self.db).await?;
        info!(code = %updated.code, "promo code deactivated");
        Ok(updated)
    }
}

pub(crate) fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn promo(discount_type: DiscountType, value: Decimal) -> PromoCodeModel {
        let now = Utc::now();
        PromoCodeModel {
            id: Uuid::new_v4(),
            code: "SAVE20".to_string(),
            description: Some("Twenty off".to_string()),
            discount_type,
            discount_value: value,
            minimum_amount: Decimal::ZERO,
            maximum_discount: None,
            usage_limit: None,
            used_count: 0,
            valid_from: now - Duration::days(1),
            valid_until: Some(now + Duration::days(30)),
            applicable_ticket_types: None,
            applicable_event_id: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn selection(total: Decimal) -> CandidateSelection {
        CandidateSelection {
            ticket_types: vec!["General Admission".to_string()],
            event_id: Some("main-event".to_string()),
            total,
        }
    }

    #[test]
    fn percentage_discount_is_capped() {
        let mut code = promo(DiscountType::Percentage, dec!(20));
        code.maximum_discount = Some(dec!(50));
        let result = evaluate(&code, &selection(dec!(1000)), Utc::now()).unwrap();
        assert_eq!(result.amount, dec!(50));
    }

    #[test]
    fn percentage_discount_without_cap() {
        let code = promo(DiscountType::Percentage, dec!(20));
        let result = evaluate(&code, &selection(dec!(190)), Utc::now()).unwrap();
        assert_eq!(result.amount, dec!(38.00));
        assert_eq!(result.code, "SAVE20");
    }

    #[test]
    fn fixed_discount_never_exceeds_total() {
        let code = promo(DiscountType::Fixed, dec!(500));
        let result = evaluate(&code, &selection(dec!(95)), Utc::now()).unwrap();
        assert_eq!(result.amount, dec!(95));
    }

    #[test]
    fn window_checks_come_first() {
        let mut code = promo(DiscountType::Fixed, dec!(10));
        code.valid_from = Utc::now() + Duration::days(1);
        code.usage_limit = Some(0);
        assert!(matches!(
            evaluate(&code, &selection(dec!(100)), Utc::now()),
            Err(PromoCodeError::NotYetActive(_))
        ));

        let mut code = promo(DiscountType::Fixed, dec!(10));
        code.valid_until = Some(Utc::now() - Duration::hours(1));
        assert!(matches!(
            evaluate(&code, &selection(dec!(100)), Utc::now()),
            Err(PromoCodeError::Expired(_))
        ));
    }

    #[test]
    fn exhausted_code_is_rejected() {
        let mut code = promo(DiscountType::Fixed, dec!(10));
        code.usage_limit = Some(3);
        code.used_count = 3;
        assert!(matches!(
            evaluate(&code, &selection(dec!(100)), Utc::now()),
            Err(PromoCodeError::UsageLimitExceeded(_))
        ));
    }

    #[test]
    fn applicability_by_ticket_type_or_event() {
        let mut code = promo(DiscountType::Fixed, dec!(10));
        code.applicable_ticket_types = Some(serde_json::json!(["VIP"]));
        assert!(matches!(
            evaluate(&code, &selection(dec!(100)), Utc::now()),
            Err(PromoCodeError::NotApplicable(_))
        ));

        let mut vip = selection(dec!(250));
        vip.ticket_types = vec!["vip".to_string()];
        assert!(evaluate(&code, &vip, Utc::now()).is_ok());

        let mut code = promo(DiscountType::Fixed, dec!(10));
        code.applicable_event_id = Some("main-event".to_string());
        assert!(evaluate(&code, &selection(dec!(100)), Utc::now()).is_ok());
    }

    #[test]
    fn minimum_spend_is_enforced() {
        let mut code = promo(DiscountType::Fixed, dec!(10));
        code.minimum_amount = dec!(200);
        assert_eq!(
            evaluate(&code, &selection(dec!(190)), Utc::now()),
            Err(PromoCodeError::MinimumNotMet {
                code: "SAVE20".into(),
                minimum: dec!(200)
            })
        );
    }

    #[test]
    fn inactive_code_reads_as_not_found() {
        let mut code = promo(DiscountType::Fixed, dec!(10));
        code.is_active = false;
        assert!(matches!(
            evaluate(&code, &selection(dec!(100)), Utc::now()),
            Err(PromoCodeError::NotFound(_))
        ));
    }

    #[test]
    fn new_promo_code_validation() {
        let input = NewPromoCode {
            code: "HALF".into(),
            description: None,
            discount_type: DiscountType::Percentage,
            discount_value: dec!(150),
            minimum_amount: Decimal::ZERO,
            maximum_discount: None,
            usage_limit: None,
            valid_from: None,
            valid_until: None,
            applicable_ticket_types: vec![],
            applicable_event_id: None,
        };
        assert!(input.validate().is_err());

        let input = NewPromoCode {
            discount_value: dec!(50),
            ..input
        };
        assert!(input.validate().is_ok());
    }

    #[test]
    fn codes_are_normalized() {
        assert_eq!(normalize_code("  save20 "), "SAVE20");
    }
}
