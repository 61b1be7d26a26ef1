//! Bridge fee model
//!
//! `fee = clamp(base_fee + amount * bps / 10000, min_fee, max_fee)`, with the
//! percentage part floored to a base unit. Computed once at creation.

use super::FeeSchedule;
use crate::error::ValidationError;

use serde::Serialize;

const BASIS_POINTS_DENOMINATOR: u128 = 10_000;

/// Fee split for a transfer amount. `fee + net_amount == amount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeQuote {
    pub fee: u128,
    pub net_amount: u128,
}

/// Compute the fee for `amount` against the destination chain's schedule
pub fn compute_fee(amount: u128, schedule: &FeeSchedule) -> Result<FeeQuote, ValidationError> {
    let percentage = amount
        .checked_mul(u128::from(schedule.percentage_basis_points))
        .ok_or(ValidationError::FeeOverflow(amount))?
        / BASIS_POINTS_DENOMINATOR;

    let raw = schedule
        .base_fee
        .checked_add(percentage)
        .ok_or(ValidationError::FeeOverflow(amount))?;

    let fee = raw.clamp(schedule.min_fee, schedule.max_fee);

    let net_amount = amount
        .checked_sub(fee)
        .ok_or(ValidationError::FeeExceedsAmount { amount, fee })?;

    Ok(FeeQuote { fee, net_amount })
}
