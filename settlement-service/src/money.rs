//! Money helpers: rounding, comparison tolerance and wire formatting.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serializer;

/// Two amounts closer than this are treated as equal.
pub const TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Round to cents, half away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Fixed two-decimal string, e.g. `12.50`.
pub fn format_money(value: Decimal) -> String {
    let mut rounded = round_money(value);
    rounded.rescale(2);
    rounded.to_string()
}

/// Lossless integer cents for a rounded amount.
pub fn to_cents(value: Decimal) -> i64 {
    let mut rounded = round_money(value);
    rounded.rescale(2);
    let mantissa = rounded.mantissa();
    i64::try_from(mantissa).unwrap_or(if mantissa.is_negative() {
        i64::MIN
    } else {
        i64::MAX
    })
}

pub fn approx_eq(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() < TOLERANCE
}

/// `serialize_with` adapter emitting [`format_money`].
pub fn serialize<S>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_money(*value))
}

pub fn serialize_option<S>(value: &Option<Decimal>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(v) => serializer.serialize_some(&format_money(*v)),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(round_money(dec!(0.125)), dec!(0.13));
        assert_eq!(round_money(dec!(-0.125)), dec!(-0.13));
        assert_eq!(round_money(dec!(14.994)), dec!(14.99));
    }

    #[test]
    fn formats_with_two_decimals() {
        assert_eq!(format_money(dec!(12.5)), "12.50");
        assert_eq!(format_money(dec!(300)), "300.00");
        assert_eq!(format_money(dec!(-0.005)), "-0.01");
    }

    #[test]
    fn cents_are_lossless() {
        assert_eq!(to_cents(dec!(12.5)), 1250);
        assert_eq!(to_cents(dec!(-100)), -10000);
        assert_eq!(to_cents(dec!(0.015)), 2);
    }

    #[test]
    fn tolerance_is_one_cent() {
        assert_eq!(TOLERANCE, dec!(0.01));
        assert!(approx_eq(dec!(10.004), dec!(10)));
        assert!(!approx_eq(dec!(10.01), dec!(10)));
    }
}
