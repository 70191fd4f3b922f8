//! Payments and their allocation to transactions.

use crate::models::party::{PartyType, PaymentDirection, PaymentMethod, PaymentStatus};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: Uuid,
    pub shop_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub counterparty_id: Option<Uuid>,
    pub payer_type: String,
    pub payee_type: String,
    pub amount: Decimal,
    pub method: String,
    pub status: String,
    pub force_override: bool,
    pub notes: Option<String>,
    pub payment_date: DateTime<Utc>,
    pub applied_to_expenses: Option<Decimal>,
    pub applied_to_balance: Option<Decimal>,
    pub balance_before: Option<Decimal>,
    pub balance_after: Option<Decimal>,
    pub created_by: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

impl Payment {
    pub fn direction(&self) -> PaymentDirection {
        match (
            PartyType::parse(&self.payer_type),
            PartyType::parse(&self.payee_type),
        ) {
            (Some(payer), Some(payee)) => PaymentDirection::of(payer, payee),
            _ => PaymentDirection::Other,
        }
    }

    pub fn parsed_status(&self) -> Option<PaymentStatus> {
        PaymentStatus::parse(&self.status)
    }

    pub fn is_paid(&self) -> bool {
        self.parsed_status() == Some(PaymentStatus::Paid)
    }

    /// Standalone payments carry no transaction link.
    pub fn is_standalone(&self) -> bool {
        self.transaction_id.is_none()
    }
}

/// A payment that passed boundary validation, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub shop_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    pub counterparty_id: Option<Uuid>,
    pub payer_type: PartyType,
    pub payee_type: PartyType,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub notes: Option<String>,
    pub payment_date: Option<DateTime<Utc>>,
    pub force_override: bool,
}

impl NewPayment {
    pub fn direction(&self) -> PaymentDirection {
        PaymentDirection::of(self.payer_type, self.payee_type)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentAllocation {
    pub allocation_id: Uuid,
    pub payment_id: Uuid,
    pub transaction_id: Uuid,
    #[serde(serialize_with = "crate::money::serialize")]
    pub allocated_amount: Decimal,
    pub created_utc: DateTime<Utc>,
}
