//! Fixed-point money helpers.
//!
//! Every amount is a [`Decimal`] quantised to the currency's minor unit
//! ([`MINOR_UNIT_SCALE`] decimal places). Rounding always uses round-half-even
//! so that repeated postings carry no systematic bias.
//!
//! ```text
//! net = round_half_even(gross * (1 - share), MINOR_UNIT_SCALE)
//! ```

use rust_decimal::{Decimal, RoundingStrategy};

/// Decimal places of the currency minor unit (cents).
pub const MINOR_UNIT_SCALE: u32 = 2;

/// Round an amount to the minor unit using round-half-even.
pub fn round_minor(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MINOR_UNIT_SCALE, RoundingStrategy::MidpointNearestEven)
}

/// Whether the amount is already exact to the minor unit.
pub fn is_minor_exact(amount: Decimal) -> bool {
    amount.normalize().scale() <= MINOR_UNIT_SCALE
}

/// Whether a fraction lies in the closed interval `[0, 1]`.
pub fn is_unit_fraction(fraction: Decimal) -> bool {
    fraction >= Decimal::ZERO && fraction <= Decimal::ONE
}

/// Net amount after deducting a platform share, rounded to the minor unit.
///
/// Returns `None` on arithmetic overflow.
pub fn net_of_share(gross: Decimal, share_fraction: Decimal) -> Option<Decimal> {
    let keep = Decimal::ONE.checked_sub(share_fraction)?;
    gross.checked_mul(keep).map(round_minor)
}

/// `amount * rate` rounded to the minor unit. Returns `None` on overflow.
pub fn apply_rate(amount: Decimal, rate: Decimal) -> Option<Decimal> {
    amount.checked_mul(rate).map(round_minor)
}

/// Convert a minor-exact amount into integer minor units (cents).
///
/// Returns `None` if the amount is not minor-exact or does not fit `i64`.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    if !is_minor_exact(amount) {
        return None;
    }
    let scaled = amount.checked_mul(Decimal::from(10i64.pow(MINOR_UNIT_SCALE)))?;
    i64::try_from(scaled.trunc()).ok()
}

/// Build an amount from integer minor units (cents).
pub fn from_minor_units(units: i64) -> Decimal {
    Decimal::new(units, MINOR_UNIT_SCALE)
}
