//! Append-only history: ledger entries, balance snapshots and audit records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One balance movement. The sum of `delta_amount` per user is the
/// canonical balance the cached field is reconciled against.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub shop_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    pub user_id: Uuid,
    pub role: String,
    #[serde(serialize_with = "crate::money::serialize")]
    pub delta_amount: Decimal,
    #[serde(serialize_with = "crate::money::serialize")]
    pub balance_before: Decimal,
    #[serde(serialize_with = "crate::money::serialize")]
    pub balance_after: Decimal,
    pub reason_code: String,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub shop_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    pub user_id: Uuid,
    pub role: String,
    pub delta_amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub reason_code: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub snapshot_id: Uuid,
    pub user_id: Uuid,
    #[serde(serialize_with = "crate::money::serialize")]
    pub previous_balance: Decimal,
    #[serde(serialize_with = "crate::money::serialize")]
    pub amount_change: Decimal,
    #[serde(serialize_with = "crate::money::serialize")]
    pub new_balance: Decimal,
    pub reason: String,
    pub reference_type: Option<String>,
    pub reference_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AuditLog {
    pub audit_id: Uuid,
    pub shop_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: serde_json::Value,
    pub created_utc: DateTime<Utc>,
}
