//! Sales recorded between a farmer and a buyer through a shop.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Buyer-side settlement progress of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionPaymentStatus {
    Pending,
    Partial,
    Paid,
}

impl TransactionPaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Paid => "paid",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "pending" => Some(Self::Pending),
            "partial" => Some(Self::Partial),
            "paid" => Some(Self::Paid),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionPaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sale. Amounts are immutable after creation; only `payment_status` moves.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: Uuid,
    pub shop_id: Uuid,
    pub farmer_id: Uuid,
    pub buyer_id: Uuid,
    #[serde(serialize_with = "crate::money::serialize")]
    pub total_amount: Decimal,
    #[serde(serialize_with = "crate::money::serialize")]
    pub commission_amount: Decimal,
    #[serde(serialize_with = "crate::money::serialize")]
    pub farmer_earning: Decimal,
    pub payment_status: String,
    pub description: Option<String>,
    pub transaction_date: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTransaction {
    pub shop_id: Uuid,
    pub farmer_id: Uuid,
    pub buyer_id: Uuid,
    pub total_amount: Decimal,
    pub commission_amount: Decimal,
    pub farmer_earning: Decimal,
    pub description: Option<String>,
    pub transaction_date: Option<DateTime<Utc>>,
}
