//! Expense recording, manual settlement and retroactive payment compensation.

use crate::error::{FieldError, SettlementError};
use crate::models::{CreateExpense, Expense, ExpenseSettlement, UserRole};
use crate::money;
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::{audit, db_error, directory, fifo};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use sqlx::PgConnection;
use tracing::{info, instrument};
use uuid::Uuid;

const EXPENSE_COLUMNS: &str = "expense_id, shop_id, user_id, transaction_id, amount, expense_type, \
     description, status, created_by, created_utc";

/// Round to cents, then require a positive result.
pub fn rounded_positive(amount: Decimal) -> Result<Decimal, SettlementError> {
    let amount = money::round_money(amount);
    if amount <= Decimal::ZERO {
        return Err(SettlementError::invalid("amount", "must be at least 0.01"));
    }
    Ok(amount)
}

#[instrument(skip(conn, input), fields(shop_id = %input.shop_id, user_id = %input.user_id, amount = %input.amount))]
pub async fn create_expense(
    conn: &mut PgConnection,
    input: &CreateExpense,
    actor_id: Option<Uuid>,
) -> Result<Expense, SettlementError> {
    let amount = rounded_positive(input.amount)?;
    let user = directory::lock_user(&mut *conn, input.user_id).await?;
    if user.shop_id != Some(input.shop_id) {
        return Err(SettlementError::invalid("user_id", "user does not belong to this shop"));
    }
    if user.parsed_role() == Some(UserRole::Owner) {
        return Err(SettlementError::invalid("user_id", "expenses cannot be charged to the owner"));
    }

    let timer = DB_QUERY_DURATION
        .with_label_values(&["create_expense"])
        .start_timer();

    let sql = format!(
        r#"
        INSERT INTO expenses (expense_id, shop_id, user_id, transaction_id, amount, expense_type, description, created_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {}
        "#,
        EXPENSE_COLUMNS
    );
    let expense = sqlx::query_as::<_, Expense>(&sql)
        .bind(Uuid::new_v4())
        .bind(input.shop_id)
        .bind(input.user_id)
        .bind(input.transaction_id)
        .bind(amount)
        .bind(input.expense_type.as_str())
        .bind(&input.description)
        .bind(actor_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error("Failed to create expense"))?;

    audit::record(
        &mut *conn,
        audit::AuditRecord {
            shop_id: Some(expense.shop_id),
            actor_id,
            action: "expense_created",
            entity_type: "expense",
            entity_id: Some(expense.expense_id),
            old_values: None,
            new_values: json!({
                "user_id": expense.user_id,
                "amount": money::format_money(expense.amount),
                "expense_type": expense.expense_type,
            }),
        },
    )
    .await?;

    timer.observe_duration();
    info!(expense_id = %expense.expense_id, "Expense created");

    Ok(expense)
}

pub async fn get_expense(
    conn: &mut PgConnection,
    expense_id: Uuid,
    lock: bool,
) -> Result<Expense, SettlementError> {
    let sql = format!(
        "SELECT {} FROM expenses WHERE expense_id = $1{}",
        EXPENSE_COLUMNS,
        if lock { " FOR UPDATE" } else { "" }
    );
    sqlx::query_as::<_, Expense>(&sql)
        .bind(expense_id)
        .fetch_optional(conn)
        .await
        .map_err(db_error("Failed to get expense"))?
        .ok_or_else(|| SettlementError::not_found("expense", expense_id))
}

pub async fn list_settlements(
    conn: &mut PgConnection,
    expense_id: Uuid,
) -> Result<Vec<ExpenseSettlement>, SettlementError> {
    sqlx::query_as::<_, ExpenseSettlement>(
        r#"
        SELECT settlement_id, expense_id, payment_id, amount, notes, settled_utc
        FROM expense_settlements
        WHERE expense_id = $1
        ORDER BY settled_utc, seq
        "#,
    )
    .bind(expense_id)
    .fetch_all(conn)
    .await
    .map_err(db_error("Failed to list expense settlements"))
}

/// Settle part of one expense directly, without a payment.
#[instrument(skip(conn), fields(expense_id = %expense_id, amount = %amount))]
pub async fn settle_expense_amount(
    conn: &mut PgConnection,
    expense_id: Uuid,
    amount: Decimal,
    notes: Option<String>,
) -> Result<(Expense, ExpenseSettlement), SettlementError> {
    let amount = rounded_positive(amount)?;
    // User before expense, the same order payments take.
    let owner = get_expense(&mut *conn, expense_id, false).await?;
    directory::lock_user(&mut *conn, owner.user_id).await?;
    let expense = get_expense(&mut *conn, expense_id, true).await?;
    let settled: Decimal = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0) FROM expense_settlements WHERE expense_id = $1",
    )
    .bind(expense_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error("Failed to sum expense settlements"))?;

    let open = (expense.amount - settled).max(Decimal::ZERO);
    if amount > open {
        return Err(SettlementError::Validation(vec![FieldError::new(
            "amount",
            format!("exceeds the unsettled remainder of {}", money::format_money(open)),
        )]));
    }

    let settlement = sqlx::query_as::<_, ExpenseSettlement>(
        r#"
        INSERT INTO expense_settlements (settlement_id, expense_id, payment_id, amount, notes)
        VALUES ($1, $2, NULL, $3, $4)
        RETURNING settlement_id, expense_id, payment_id, amount, notes, settled_utc
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(expense_id)
    .bind(amount)
    .bind(notes)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error("Failed to record expense settlement"))?;

    if amount >= open {
        fifo::mark_expense_settled(&mut *conn, expense_id).await?;
    }

    let expense = get_expense(conn, expense_id, false).await?;
    info!(status = %expense.status, "Expense settled manually");

    Ok((expense, settlement))
}

/// A recent shop-to-farmer payment that can absorb a retroactive expense.
#[derive(Debug, Clone, PartialEq)]
pub struct ClawbackCandidate {
    pub payment_id: Uuid,
    pub amount: Decimal,
    /// `(allocation_id, allocated_amount)`, newest first.
    pub allocations: Vec<(Uuid, Decimal)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentAdjustment {
    pub payment_id: Uuid,
    #[serde(serialize_with = "money::serialize")]
    pub previous_amount: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub reduced_by: Decimal,
    /// `(allocation_id, reduce_by)` applied to the payment's allocations.
    #[serde(skip)]
    pub allocation_reductions: Vec<(Uuid, Decimal)>,
}

/// Walk `candidates` (newest first), reducing each by up to what is left of
/// `expense_amount`. A payment's unallocated part absorbs first, then its
/// allocations newest first.
pub fn plan_clawback(expense_amount: Decimal, candidates: &[ClawbackCandidate]) -> Vec<PaymentAdjustment> {
    let mut remaining = expense_amount.max(Decimal::ZERO);
    let mut adjustments = Vec::new();

    for candidate in candidates {
        if remaining <= Decimal::ZERO {
            break;
        }
        if candidate.amount <= Decimal::ZERO {
            continue;
        }
        let reduction = remaining.min(candidate.amount);
        remaining -= reduction;

        let allocated: Decimal = candidate.allocations.iter().map(|(_, a)| *a).sum();
        let unallocated = (candidate.amount - allocated).max(Decimal::ZERO);
        let mut from_allocations = (reduction - unallocated).max(Decimal::ZERO);

        let mut allocation_reductions = Vec::new();
        for (allocation_id, allocated_amount) in &candidate.allocations {
            if from_allocations <= Decimal::ZERO {
                break;
            }
            let cut = from_allocations.min(*allocated_amount);
            from_allocations -= cut;
            allocation_reductions.push((*allocation_id, cut));
        }

        adjustments.push(PaymentAdjustment {
            payment_id: candidate.payment_id,
            previous_amount: candidate.amount,
            reduced_by: reduction,
            allocation_reductions,
        });
    }

    adjustments
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClawbackOutcome {
    #[serde(serialize_with = "money::serialize")]
    pub absorbed: Decimal,
    pub adjustments: Vec<PaymentAdjustment>,
}

#[derive(Debug, sqlx::FromRow)]
struct CandidateRow {
    payment_id: Uuid,
    amount: Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct CandidateAllocationRow {
    allocation_id: Uuid,
    payment_id: Uuid,
    allocated_amount: Decimal,
}

/// Reduce the farmer's most recent PAID shop-to-farmer payments, newest
/// first, by a newly recorded expense. Only payments created within
/// `window_days` are touched; zero disables the compensation.
#[instrument(skip(conn), fields(shop_id = %shop_id, farmer_id = %farmer_id, expense_id = %expense_id))]
pub async fn adjust_payments_for_expense(
    conn: &mut PgConnection,
    shop_id: Uuid,
    farmer_id: Uuid,
    expense_amount: Decimal,
    expense_id: Uuid,
    window_days: i32,
    actor_id: Option<Uuid>,
) -> Result<ClawbackOutcome, SettlementError> {
    let nothing = ClawbackOutcome {
        absorbed: Decimal::ZERO,
        adjustments: Vec::new(),
    };
    if window_days <= 0 || expense_amount <= Decimal::ZERO {
        return Ok(nothing);
    }

    let timer = DB_QUERY_DURATION
        .with_label_values(&["adjust_payments_for_expense"])
        .start_timer();

    let rows = sqlx::query_as::<_, CandidateRow>(
        r#"
        SELECT payment_id, amount FROM payments
        WHERE shop_id = $1 AND counterparty_id = $2
          AND payer_type = 'SHOP' AND payee_type = 'FARMER' AND status = 'PAID'
          AND amount > 0
          AND created_utc >= clock_timestamp() - make_interval(days => $3)
        ORDER BY created_utc DESC, seq DESC
        FOR UPDATE
        "#,
    )
    .bind(shop_id)
    .bind(farmer_id)
    .bind(window_days)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to load recent farmer payments"))?;

    if rows.is_empty() {
        timer.observe_duration();
        return Ok(nothing);
    }

    let payment_ids: Vec<Uuid> = rows.iter().map(|r| r.payment_id).collect();
    let allocation_rows = sqlx::query_as::<_, CandidateAllocationRow>(
        r#"
        SELECT allocation_id, payment_id, allocated_amount FROM payment_allocations
        WHERE payment_id = ANY($1)
        ORDER BY created_utc DESC, seq DESC
        FOR UPDATE
        "#,
    )
    .bind(&payment_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to load payment allocations"))?;

    let candidates: Vec<ClawbackCandidate> = rows
        .into_iter()
        .map(|row| ClawbackCandidate {
            payment_id: row.payment_id,
            amount: row.amount,
            allocations: allocation_rows
                .iter()
                .filter(|a| a.payment_id == row.payment_id)
                .map(|a| (a.allocation_id, a.allocated_amount))
                .collect(),
        })
        .collect();

    let adjustments = plan_clawback(expense_amount, &candidates);
    let note = format!("Adjusted for expense {}", expense_id);

    for adjustment in &adjustments {
        // Expense settlements this payment already made are kept as recorded;
        // only its amount and allocations shrink.
        let settlements_kept: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM expense_settlements WHERE payment_id = $1",
        )
        .bind(adjustment.payment_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error("Failed to sum payment settlements"))?;

        sqlx::query(
            r#"
            UPDATE payments
            SET amount = amount - $1,
                notes = CASE WHEN notes IS NULL OR notes = '' THEN $2 ELSE notes || ' | ' || $2 END
            WHERE payment_id = $3
            "#,
        )
        .bind(adjustment.reduced_by)
        .bind(&note)
        .bind(adjustment.payment_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to reduce payment"))?;

        for (allocation_id, cut) in &adjustment.allocation_reductions {
            sqlx::query(
                "DELETE FROM payment_allocations WHERE allocation_id = $2 AND allocated_amount <= $1",
            )
            .bind(*cut)
            .bind(*allocation_id)
            .execute(&mut *conn)
            .await
            .map_err(db_error("Failed to remove emptied allocation"))?;

            sqlx::query(
                r#"
                UPDATE payment_allocations SET allocated_amount = allocated_amount - $1
                WHERE allocation_id = $2 AND allocated_amount > $1
                "#,
            )
            .bind(*cut)
            .bind(*allocation_id)
            .execute(&mut *conn)
            .await
            .map_err(db_error("Failed to reduce allocation"))?;
        }

        audit::record(
            &mut *conn,
            audit::AuditRecord {
                shop_id: Some(shop_id),
                actor_id,
                action: "payment_adjusted_for_expense",
                entity_type: "payment",
                entity_id: Some(adjustment.payment_id),
                old_values: Some(json!({ "amount": money::format_money(adjustment.previous_amount) })),
                new_values: json!({
                    "amount": money::format_money(adjustment.previous_amount - adjustment.reduced_by),
                    "expense_id": expense_id,
                    "reduced_by": money::format_money(adjustment.reduced_by),
                    "expense_settlements_kept": money::format_money(settlements_kept),
                }),
            },
        )
        .await?;
    }

    let absorbed: Decimal = adjustments.iter().map(|a| a.reduced_by).sum();
    timer.observe_duration();
    info!(
        absorbed = %absorbed,
        payments = adjustments.len(),
        "Recent payments adjusted for expense"
    );

    Ok(ClawbackOutcome {
        absorbed,
        adjustments,
    })
}
