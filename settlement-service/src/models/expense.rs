//! Debts a user owes the shop and their settlement history.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpenseType {
    Expense,
    Advance,
    Adjustment,
}

impl ExpenseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expense => "expense",
            Self::Advance => "advance",
            Self::Adjustment => "adjustment",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "expense" => Some(Self::Expense),
            "advance" => Some(Self::Advance),
            "adjustment" => Some(Self::Adjustment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpenseStatus {
    Pending,
    Settled,
}

impl ExpenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Settled => "settled",
        }
    }
}

/// `amount` is the original debt and never changes; progress lives in settlements.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Expense {
    pub expense_id: Uuid,
    pub shop_id: Uuid,
    pub user_id: Uuid,
    pub transaction_id: Option<Uuid>,
    #[serde(serialize_with = "crate::money::serialize")]
    pub amount: Decimal,
    pub expense_type: String,
    pub description: Option<String>,
    pub status: String,
    pub created_by: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ExpenseSettlement {
    pub settlement_id: Uuid,
    pub expense_id: Uuid,
    pub payment_id: Option<Uuid>,
    #[serde(serialize_with = "crate::money::serialize")]
    pub amount: Decimal,
    pub notes: Option<String>,
    pub settled_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExpense {
    pub shop_id: Uuid,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub expense_type: ExpenseType,
    pub description: Option<String>,
    pub transaction_id: Option<Uuid>,
}
