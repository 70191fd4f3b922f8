//! Append-only ledger and balance snapshots. Rows are inserted, never updated.

use crate::error::SettlementError;
use crate::models::{BalanceSnapshot, LedgerEntry, NewLedgerEntry};
use crate::services::db_error;
use crate::services::metrics::DB_QUERY_DURATION;
use rust_decimal::Decimal;
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

#[instrument(skip(conn, entry), fields(user_id = %entry.user_id, delta = %entry.delta_amount, reason = %entry.reason_code))]
pub async fn append_entry(
    conn: &mut PgConnection,
    entry: NewLedgerEntry,
) -> Result<LedgerEntry, SettlementError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["append_ledger_entry"])
        .start_timer();

    let row = sqlx::query_as::<_, LedgerEntry>(
        r#"
        INSERT INTO transaction_ledger
            (entry_id, shop_id, transaction_id, user_id, role, delta_amount, balance_before, balance_after, reason_code)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING entry_id, shop_id, transaction_id, user_id, role, delta_amount,
                  balance_before, balance_after, reason_code, created_utc
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(entry.shop_id)
    .bind(entry.transaction_id)
    .bind(entry.user_id)
    .bind(&entry.role)
    .bind(entry.delta_amount)
    .bind(entry.balance_before)
    .bind(entry.balance_after)
    .bind(&entry.reason_code)
    .fetch_one(conn)
    .await
    .map_err(db_error("Failed to append ledger entry"))?;

    timer.observe_duration();
    Ok(row)
}

/// Why a balance moved, recorded on the snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotReason {
    pub reason: String,
    pub reference_type: Option<&'static str>,
    pub reference_id: Option<Uuid>,
}

pub async fn record_snapshot(
    conn: &mut PgConnection,
    user_id: Uuid,
    previous_balance: Decimal,
    new_balance: Decimal,
    reason: &SnapshotReason,
) -> Result<(), SettlementError> {
    sqlx::query(
        r#"
        INSERT INTO balance_snapshots
            (snapshot_id, user_id, previous_balance, amount_change, new_balance, reason, reference_type, reference_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(previous_balance)
    .bind(new_balance - previous_balance)
    .bind(new_balance)
    .bind(&reason.reason)
    .bind(reason.reference_type)
    .bind(reason.reference_id)
    .execute(conn)
    .await
    .map_err(db_error("Failed to record balance snapshot"))?;
    Ok(())
}

/// Balance implied by the ledger: the sum of every delta for the user.
pub async fn ledger_balance(conn: &mut PgConnection, user_id: Uuid) -> Result<Decimal, SettlementError> {
    sqlx::query_scalar::<_, Decimal>(
        "SELECT COALESCE(SUM(delta_amount), 0) FROM transaction_ledger WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_one(conn)
    .await
    .map_err(db_error("Failed to sum ledger"))
}

/// Most recent entries first.
pub async fn list_entries(
    conn: &mut PgConnection,
    user_id: Uuid,
    limit: i64,
) -> Result<Vec<LedgerEntry>, SettlementError> {
    sqlx::query_as::<_, LedgerEntry>(
        r#"
        SELECT entry_id, shop_id, transaction_id, user_id, role, delta_amount,
               balance_before, balance_after, reason_code, created_utc
        FROM transaction_ledger
        WHERE user_id = $1
        ORDER BY created_utc DESC, seq DESC
        LIMIT $2
        "#,
    )
    .bind(user_id)
    .bind(limit.clamp(1, 500))
    .fetch_all(conn)
    .await
    .map_err(db_error("Failed to list ledger entries"))
}

pub async fn list_snapshots(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<Vec<BalanceSnapshot>, SettlementError> {
    sqlx::query_as::<_, BalanceSnapshot>(
        r#"
        SELECT snapshot_id, user_id, previous_balance, amount_change, new_balance,
               reason, reference_type, reference_id, created_utc
        FROM balance_snapshots
        WHERE user_id = $1
        ORDER BY created_utc, seq
        "#,
    )
    .bind(user_id)
    .fetch_all(conn)
    .await
    .map_err(db_error("Failed to list balance snapshots"))
}
