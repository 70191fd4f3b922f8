//! Request/response shapes for the HTTP surface.
//!
//! Requests carry raw strings for enums so casing and aliases are normalised
//! here, at the boundary. Responses render money as 2-decimal strings.

pub mod ledger;
pub mod participant;
pub mod payment;

pub use ledger::*;
pub use participant::*;
pub use payment::*;

use crate::models::{ExpenseType, PartyType, PaymentMethod, PaymentStatus, UserRole};
use crate::money;
use rust_decimal::Decimal;
use std::borrow::Cow;
use validator::ValidationError;

fn rejected(code: &'static str, message: String) -> ValidationError {
    let mut error = ValidationError::new(code);
    error.message = Some(Cow::Owned(message));
    error
}

pub(crate) fn positive_amount(value: &Decimal) -> Result<(), ValidationError> {
    if money::round_money(*value) > Decimal::ZERO {
        Ok(())
    } else {
        Err(rejected("positive", "must be at least 0.01".to_string()))
    }
}

pub(crate) fn non_negative_amount(value: &Decimal) -> Result<(), ValidationError> {
    if *value >= Decimal::ZERO {
        Ok(())
    } else {
        Err(rejected("non_negative", "must not be negative".to_string()))
    }
}

pub(crate) fn party_type(value: &str) -> Result<(), ValidationError> {
    PartyType::parse(value)
        .map(|_| ())
        .ok_or_else(|| rejected("party_type", format!("unknown party type '{}'", value)))
}

pub(crate) fn payment_method(value: &str) -> Result<(), ValidationError> {
    PaymentMethod::parse(value)
        .map(|_| ())
        .ok_or_else(|| rejected("payment_method", format!("unknown payment method '{}'", value)))
}

pub(crate) fn payment_status(value: &str) -> Result<(), ValidationError> {
    PaymentStatus::parse(value)
        .map(|_| ())
        .ok_or_else(|| rejected("payment_status", format!("unknown payment status '{}'", value)))
}

pub(crate) fn expense_type(value: &str) -> Result<(), ValidationError> {
    ExpenseType::parse(value)
        .map(|_| ())
        .ok_or_else(|| rejected("expense_type", format!("unknown expense type '{}'", value)))
}

/// Only farmers and buyers are registered directly; owners come with their shop.
pub(crate) fn participant_role(value: &str) -> Result<(), ValidationError> {
    match UserRole::parse(value) {
        Some(UserRole::Farmer) | Some(UserRole::Buyer) => Ok(()),
        _ => Err(rejected(
            "participant_role",
            format!("role must be farmer or buyer, got '{}'", value),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn amount_checks() {
        assert!(positive_amount(&dec!(0.01)).is_ok());
        assert!(positive_amount(&dec!(0)).is_err());
        assert!(positive_amount(&dec!(0.004)).is_err());
        assert!(positive_amount(&dec!(0.005)).is_ok());
        assert!(non_negative_amount(&dec!(0)).is_ok());
        assert!(non_negative_amount(&dec!(-1)).is_err());
    }

    #[test]
    fn enum_checks_are_case_insensitive() {
        assert!(party_type("buyer").is_ok());
        assert!(party_type("Shop").is_ok());
        assert!(party_type("bank").is_err());
        assert!(payment_method("upi").is_ok());
        assert!(payment_method("crypto").is_err());
        assert!(payment_status("completed").is_ok());
        assert!(expense_type("ADVANCE").is_ok());
    }

    #[test]
    fn owners_cannot_be_registered_directly() {
        assert!(participant_role("farmer").is_ok());
        assert!(participant_role("BUYER").is_ok());
        let err = participant_role("owner").unwrap_err();
        assert_eq!(err.code, "participant_role");
    }
}
