//! Money arithmetic shared by pricing and settlement.
//!
//! All amounts are `Decimal`. Rounding is always to two places, half away
//! from zero.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::entities::purchase::PaymentMethod;
use crate::errors::ServiceError;

/// Rounds to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn check_inputs(amount: Decimal, rate: Decimal) -> Result<(), ServiceError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(ServiceError::InvalidAmount(format!(
            "amount {} must not be negative",
            amount
        )));
    }
    if rate <= Decimal::ZERO {
        return Err(ServiceError::InvalidAmount(format!(
            "exchange rate {} must be positive",
            rate
        )));
    }
    Ok(())
}

/// Converts a canonical-currency amount into the settlement currency.
pub fn to_settlement_currency(amount: Decimal, rate: Decimal) -> Result<Decimal, ServiceError> {
    check_inputs(amount, rate)?;
    Ok(round_money(amount * rate))
}

/// Converts a settlement-currency amount back into the canonical currency.
pub fn to_canonical_currency(amount: Decimal, rate: Decimal) -> Result<Decimal, ServiceError> {
    check_inputs(amount, rate)?;
    Ok(round_money(amount / rate))
}

/// Amount in the smallest currency unit, as gateways expect.
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    round_money(amount * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| ServiceError::InvalidAmount(format!("amount {} is out of range", amount)))
}

pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

/// An amount paired with the currency it is charged in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    pub amount: Decimal,
    pub currency: String,
}

/// Resolves which currency and amount a payment method is charged in.
#[derive(Debug, Clone)]
pub struct CurrencyResolver {
    pub canonical_currency: String,
    pub settlement_currency: String,
    pub exchange_rate: Decimal,
}

impl CurrencyResolver {
    pub fn new(
        canonical_currency: impl Into<String>,
        settlement_currency: impl Into<String>,
        exchange_rate: Decimal,
    ) -> Self {
        Self {
            canonical_currency: canonical_currency.into(),
            settlement_currency: settlement_currency.into(),
            exchange_rate,
        }
    }

    pub fn from_config(config: &crate::config::AppConfig) -> Self {
        Self::new(
            config.canonical_currency.clone(),
            config.settlement_currency.clone(),
            config.settlement_exchange_rate,
        )
    }

    /// Mobile money is charged in the settlement currency; everything else in
    /// the canonical currency.
    pub fn charge_for(
        &self,
        method: PaymentMethod,
        canonical_amount: Decimal,
    ) -> Result<Charge, ServiceError> {
        match method {
            PaymentMethod::MobileMoney => Ok(Charge {
                amount: to_settlement_currency(canonical_amount, self.exchange_rate)?,
                currency: self.settlement_currency.clone(),
            }),
            PaymentMethod::Card | PaymentMethod::BankTransfer => Ok(Charge {
                amount: round_money(canonical_amount),
                currency: self.canonical_currency.clone(),
            }),
        }
    }

    /// Maps an amount reported by the gateway back to the canonical currency.
    pub fn canonical_amount(&self, amount: Decimal, currency: &str) -> Result<Decimal, ServiceError> {
        if currency.eq_ignore_ascii_case(&self.settlement_currency)
            && !currency.eq_ignore_ascii_case(&self.canonical_currency)
        {
            to_canonical_currency(amount, self.exchange_rate)
        } else {
            Ok(round_money(amount))
        }
    }
}
