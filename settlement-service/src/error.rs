//! Error taxonomy for settlement operations.

use crate::money;
use axum::response::{IntoResponse, Response};
use rust_decimal::Decimal;
use serde_json::json;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

/// One rejected input field.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettlementError {
    /// Input rejected before anything was persisted.
    #[error("Validation failed: {}", summarize(.0))]
    Validation(Vec<FieldError>),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// Shop-to-farmer payment would create or deepen farmer debt.
    #[error(
        "Payment would worsen farmer debt (current balance {current_balance}, simulated {simulated_new_balance})"
    )]
    DebtGuardRejection {
        current_balance: Decimal,
        simulated_new_balance: Decimal,
    },

    /// Store or infrastructure failure; the outer transaction is rolled back.
    #[error("Domain failure: {0}")]
    Domain(#[from] anyhow::Error),
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl SettlementError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }

    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    /// Short label for the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::DebtGuardRejection { .. } => "debt_guard",
            Self::Domain(_) => "domain",
        }
    }
}

impl From<sqlx::Error> for SettlementError {
    fn from(err: sqlx::Error) -> Self {
        Self::Domain(anyhow::Error::new(err))
    }
}

impl From<SettlementError> for AppError {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::Validation(errors) => AppError::InvalidInput {
                message: "Validation failed".to_string(),
                details: Some(json!(errors)),
            },
            SettlementError::NotFound { entity, id } => {
                AppError::NotFound(anyhow::anyhow!("{} {} not found", entity, id))
            }
            SettlementError::DebtGuardRejection {
                current_balance,
                simulated_new_balance,
            } => AppError::RuleViolation {
                message: "Payment would worsen farmer debt; resubmit with force_override to proceed"
                    .to_string(),
                details: json!({
                    "current_balance": money::format_money(current_balance),
                    "simulated_new_balance": money::format_money(simulated_new_balance),
                }),
            },
            SettlementError::Domain(err) => AppError::DatabaseError(err),
        }
    }
}

impl IntoResponse for SettlementError {
    fn into_response(self) -> Response {
        if let Self::Domain(ref err) = self {
            tracing::error!(error = %err, "Settlement operation failed");
        }
        crate::services::metrics::record_error(self.kind());
        AppError::from(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use rust_decimal_macros::dec;

    #[test]
    fn guard_rejection_is_conflict() {
        let err = SettlementError::DebtGuardRejection {
            current_balance: dec!(-100),
            simulated_new_balance: dec!(-150),
        };
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn validation_lists_every_field() {
        let err = SettlementError::Validation(vec![
            FieldError::new("amount", "must be greater than zero"),
            FieldError::new("payer_type", "unknown party"),
        ]);
        assert_eq!(
            err.to_string(),
            "Validation failed: amount: must be greater than zero; payer_type: unknown party"
        );
        assert_eq!(
            err.into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn not_found_maps_to_404() {
        let err = SettlementError::not_found("payment", Uuid::nil());
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
