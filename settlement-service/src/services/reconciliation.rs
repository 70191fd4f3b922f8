//! Reconciliation auditor: compares cached state with the ledger and with
//! allocation totals. Findings are reported, never corrected, except through
//! [`fix_user_balance_discrepancy`].

use crate::error::SettlementError;
use crate::models::{PaymentDirection, TransactionPaymentStatus, User};
use crate::money;
use crate::services::balance;
use crate::services::ledger::{self, SnapshotReason};
use crate::services::metrics::{record_discrepancies, DB_QUERY_DURATION};
use crate::services::{audit, db_error, directory, transactions};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use sqlx::PgConnection;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserReconciliation {
    pub user_id: Uuid,
    pub role: String,
    #[serde(serialize_with = "money::serialize")]
    pub current_balance: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub ledger_balance: Decimal,
    /// Stored minus ledger-derived.
    #[serde(serialize_with = "money::serialize")]
    pub discrepancy: Decimal,
    pub is_reconciled: bool,
}

pub fn compare_balances(user: &User, ledger_balance: Decimal) -> UserReconciliation {
    let discrepancy = user.balance - ledger_balance;
    UserReconciliation {
        user_id: user.user_id,
        role: user.role.clone(),
        current_balance: user.balance,
        ledger_balance,
        discrepancy,
        is_reconciled: discrepancy.abs() < money::TOLERANCE,
    }
}

#[instrument(skip(conn), fields(user_id = %user_id))]
pub async fn reconcile_user_balance(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<UserReconciliation, SettlementError> {
    let user = directory::get_user(&mut *conn, user_id).await?;
    let ledger_balance = ledger::ledger_balance(&mut *conn, user_id).await?;
    let result = compare_balances(&user, ledger_balance);
    if !result.is_reconciled {
        warn!(
            current_balance = %result.current_balance,
            ledger_balance = %result.ledger_balance,
            discrepancy = %result.discrepancy,
            "Balance drifted from ledger"
        );
    }
    Ok(result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    Balanced,
    UnderAllocated,
    OverAllocated,
    /// Standalone buyer payment kept as an unallocated credit.
    BookkeepingCredit,
}

impl AllocationState {
    pub fn is_issue(&self) -> bool {
        matches!(self, Self::UnderAllocated | Self::OverAllocated)
    }
}

pub fn classify_allocation(
    direction: PaymentDirection,
    standalone: bool,
    amount: Decimal,
    allocated: Decimal,
) -> AllocationState {
    let difference = amount - allocated;
    if difference.abs() < money::TOLERANCE {
        AllocationState::Balanced
    } else if difference < Decimal::ZERO {
        AllocationState::OverAllocated
    } else if direction == PaymentDirection::BuyerToShop && standalone && allocated.is_zero() {
        AllocationState::BookkeepingCredit
    } else {
        AllocationState::UnderAllocated
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentAllocationCheck {
    pub payment_id: Uuid,
    pub direction: PaymentDirection,
    pub transaction_id: Option<Uuid>,
    #[serde(serialize_with = "money::serialize")]
    pub amount: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub allocated: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub difference: Decimal,
    pub state: AllocationState,
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentTotalsRow {
    payment_id: Uuid,
    transaction_id: Option<Uuid>,
    payer_type: String,
    payee_type: String,
    amount: Decimal,
    allocated: Decimal,
}

/// Compare each PAID allocating payment of a shop with its allocation total.
#[instrument(skip(conn), fields(shop_id = %shop_id))]
pub async fn reconcile_payment_allocations(
    conn: &mut PgConnection,
    shop_id: Uuid,
) -> Result<Vec<PaymentAllocationCheck>, SettlementError> {
    let rows = sqlx::query_as::<_, PaymentTotalsRow>(
        r#"
        SELECT p.payment_id, p.transaction_id, p.payer_type, p.payee_type, p.amount,
               COALESCE((SELECT SUM(a.allocated_amount) FROM payment_allocations a
                         WHERE a.payment_id = p.payment_id), 0) AS allocated
        FROM payments p
        WHERE p.shop_id = $1 AND p.status = 'PAID'
          AND ((p.payer_type = 'BUYER' AND p.payee_type = 'SHOP')
               OR (p.payer_type = 'SHOP' AND p.payee_type = 'FARMER'))
        ORDER BY p.created_utc, p.seq
        "#,
    )
    .bind(shop_id)
    .fetch_all(conn)
    .await
    .map_err(db_error("Failed to load payment allocation totals"))?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let direction = match (
                crate::models::PartyType::parse(&row.payer_type),
                crate::models::PartyType::parse(&row.payee_type),
            ) {
                (Some(payer), Some(payee)) => PaymentDirection::of(payer, payee),
                _ => PaymentDirection::Other,
            };
            let standalone = row.transaction_id.is_none();
            PaymentAllocationCheck {
                payment_id: row.payment_id,
                direction,
                transaction_id: row.transaction_id,
                amount: row.amount,
                allocated: row.allocated,
                difference: row.amount - row.allocated,
                state: classify_allocation(direction, standalone, row.amount, row.allocated),
            }
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionStatusCheck {
    pub transaction_id: Uuid,
    #[serde(serialize_with = "money::serialize")]
    pub total_amount: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub paid_amount: Decimal,
    pub stored_status: String,
    pub expected_status: TransactionPaymentStatus,
    pub matches: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionTotalsRow {
    transaction_id: Uuid,
    total_amount: Decimal,
    payment_status: String,
    paid: Decimal,
}

/// Infer each transaction's status from PAID buyer allocations and compare.
#[instrument(skip(conn), fields(shop_id = %shop_id))]
pub async fn reconcile_transaction_payments(
    conn: &mut PgConnection,
    shop_id: Uuid,
) -> Result<Vec<TransactionStatusCheck>, SettlementError> {
    let rows = sqlx::query_as::<_, TransactionTotalsRow>(
        r#"
        SELECT t.transaction_id, t.total_amount, t.payment_status,
               COALESCE((SELECT SUM(a.allocated_amount)
                         FROM payment_allocations a
                         JOIN payments p ON p.payment_id = a.payment_id
                         WHERE a.transaction_id = t.transaction_id
                           AND p.status = 'PAID'
                           AND p.payer_type = 'BUYER' AND p.payee_type = 'SHOP'), 0) AS paid
        FROM transactions t
        WHERE t.shop_id = $1
        ORDER BY t.transaction_date, t.created_utc, t.seq
        "#,
    )
    .bind(shop_id)
    .fetch_all(conn)
    .await
    .map_err(db_error("Failed to load transaction totals"))?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let expected = transactions::settlement_status(row.paid, row.total_amount);
            TransactionStatusCheck {
                transaction_id: row.transaction_id,
                total_amount: row.total_amount,
                paid_amount: row.paid,
                matches: TransactionPaymentStatus::parse(&row.payment_status) == Some(expected),
                stored_status: row.payment_status,
                expected_status: expected,
            }
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditSummary {
    pub users_checked: usize,
    pub users_with_discrepancy: usize,
    #[serde(serialize_with = "money::serialize")]
    pub total_discrepancy: Decimal,
    pub payments_checked: usize,
    pub payment_issues: usize,
    pub bookkeeping_credits: usize,
    pub transactions_checked: usize,
    pub transaction_mismatches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShopAuditReport {
    pub shop_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub is_healthy: bool,
    pub summary: AuditSummary,
    pub users: Vec<UserReconciliation>,
    /// Payments that are not balanced (issues and bookkeeping credits).
    pub payments: Vec<PaymentAllocationCheck>,
    /// Transactions whose stored status disagrees with their allocations.
    pub transactions: Vec<TransactionStatusCheck>,
    pub recommendations: Vec<String>,
}

pub fn summarize(
    users: &[UserReconciliation],
    payments: &[PaymentAllocationCheck],
    transactions: &[TransactionStatusCheck],
) -> AuditSummary {
    let drifted: Vec<&UserReconciliation> = users.iter().filter(|u| !u.is_reconciled).collect();
    AuditSummary {
        users_checked: users.len(),
        users_with_discrepancy: drifted.len(),
        total_discrepancy: drifted.iter().map(|u| u.discrepancy.abs()).sum(),
        payments_checked: payments.len(),
        payment_issues: payments.iter().filter(|p| p.state.is_issue()).count(),
        bookkeeping_credits: payments
            .iter()
            .filter(|p| p.state == AllocationState::BookkeepingCredit)
            .count(),
        transactions_checked: transactions.len(),
        transaction_mismatches: transactions.iter().filter(|t| !t.matches).count(),
    }
}

pub fn recommendations(summary: &AuditSummary) -> Vec<String> {
    let mut out = Vec::new();
    if summary.users_with_discrepancy > 0 {
        out.push(format!(
            "{} user balance(s) differ from the ledger; review and apply the reconciliation fix",
            summary.users_with_discrepancy
        ));
    }
    if summary.total_discrepancy > Decimal::ONE {
        out.push(format!(
            "Total balance discrepancy is {}; investigate before the next settlement run",
            money::format_money(summary.total_discrepancy)
        ));
    }
    if summary.payment_issues > 0 {
        out.push(format!(
            "{} payment(s) are under- or over-allocated; check their allocations",
            summary.payment_issues
        ));
    }
    if summary.transaction_mismatches > 0 {
        out.push(format!(
            "{} transaction(s) carry a stale payment status; refresh them from allocations",
            summary.transaction_mismatches
        ));
    }
    if out.is_empty() {
        out.push("All balances and allocations are consistent".to_string());
    }
    out
}

/// Full audit of one shop.
#[instrument(skip(conn), fields(shop_id = %shop_id))]
pub async fn audit_shop_balances(
    conn: &mut PgConnection,
    shop_id: Uuid,
) -> Result<ShopAuditReport, SettlementError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["audit_shop_balances"])
        .start_timer();

    directory::get_shop(&mut *conn, shop_id).await?;
    let holders = directory::list_balance_holders(&mut *conn, shop_id).await?;

    let mut users = Vec::with_capacity(holders.len());
    for user in &holders {
        let ledger_balance = ledger::ledger_balance(&mut *conn, user.user_id).await?;
        users.push(compare_balances(user, ledger_balance));
    }

    let payment_checks = reconcile_payment_allocations(&mut *conn, shop_id).await?;
    let transaction_checks = reconcile_transaction_payments(&mut *conn, shop_id).await?;

    let summary = summarize(&users, &payment_checks, &transaction_checks);
    let is_healthy = summary.users_with_discrepancy == 0
        && summary.payment_issues == 0
        && summary.transaction_mismatches == 0;

    record_discrepancies("user_balance", summary.users_with_discrepancy);
    record_discrepancies("payment_allocation", summary.payment_issues);
    record_discrepancies("transaction_status", summary.transaction_mismatches);
    timer.observe_duration();

    info!(
        is_healthy,
        users = summary.users_checked,
        drifted = summary.users_with_discrepancy,
        payment_issues = summary.payment_issues,
        transaction_mismatches = summary.transaction_mismatches,
        "Shop audit completed"
    );

    Ok(ShopAuditReport {
        shop_id,
        generated_at: Utc::now(),
        is_healthy,
        recommendations: recommendations(&summary),
        summary,
        users,
        payments: payment_checks
            .into_iter()
            .filter(|p| p.state != AllocationState::Balanced)
            .collect(),
        transactions: transaction_checks.into_iter().filter(|t| !t.matches).collect(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceFix {
    pub user_id: Uuid,
    #[serde(serialize_with = "money::serialize")]
    pub previous_balance: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub corrected_balance: Decimal,
    pub changed: bool,
}

/// Overwrite the stored balance with the ledger-derived value.
#[instrument(skip(conn), fields(user_id = %user_id))]
pub async fn fix_user_balance_discrepancy(
    conn: &mut PgConnection,
    user_id: Uuid,
    actor_id: Option<Uuid>,
) -> Result<BalanceFix, SettlementError> {
    let user = directory::lock_user(&mut *conn, user_id).await?;
    let ledger_balance = ledger::ledger_balance(&mut *conn, user_id).await?;

    let fix = BalanceFix {
        user_id,
        previous_balance: user.balance,
        corrected_balance: ledger_balance,
        changed: user.balance != ledger_balance,
    };
    if !fix.changed {
        return Ok(fix);
    }

    sqlx::query("UPDATE users SET balance = $1 WHERE user_id = $2")
        .bind(ledger_balance)
        .bind(user_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to correct balance"))?;

    ledger::record_snapshot(
        &mut *conn,
        user_id,
        user.balance,
        ledger_balance,
        &SnapshotReason {
            reason: "reconciliation_fix".to_string(),
            reference_type: Some("reconciliation"),
            reference_id: None,
        },
    )
    .await?;

    audit::record(
        &mut *conn,
        audit::AuditRecord {
            shop_id: user.shop_id,
            actor_id,
            action: "balance_reconciled",
            entity_type: "user",
            entity_id: Some(user_id),
            old_values: Some(json!({ "balance": money::format_money(user.balance) })),
            new_values: json!({
                "balance": money::format_money(ledger_balance),
                "discrepancy": money::format_money(user.balance - ledger_balance),
            }),
        },
    )
    .await?;

    warn!(
        previous_balance = %user.balance,
        corrected_balance = %ledger_balance,
        "Stored balance overwritten from ledger"
    );

    Ok(fix)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceDrift {
    pub user_id: Uuid,
    pub role: String,
    #[serde(serialize_with = "money::serialize")]
    pub stored_balance: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub derived_balance: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub drift: Decimal,
}

/// Users whose stored balance differs from a fresh derivation, largest drift first.
#[instrument(skip(conn), fields(shop_id = %shop_id))]
pub async fn find_drifted_users(
    conn: &mut PgConnection,
    shop_id: Uuid,
) -> Result<Vec<BalanceDrift>, SettlementError> {
    directory::get_shop(&mut *conn, shop_id).await?;
    let holders = directory::list_balance_holders(&mut *conn, shop_id).await?;

    let mut drifted = Vec::new();
    for user in &holders {
        let breakdown = balance::compute_breakdown(&mut *conn, user).await?;
        let drift = user.balance - breakdown.derived_balance;
        if drift.abs() >= money::TOLERANCE {
            drifted.push(BalanceDrift {
                user_id: user.user_id,
                role: user.role.clone(),
                stored_balance: user.balance,
                derived_balance: breakdown.derived_balance,
                drift,
            });
        }
    }
    drifted.sort_by(|a, b| b.drift.abs().cmp(&a.drift.abs()));
    record_discrepancies("derived_balance", drifted.len());

    Ok(drifted)
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceReport {
    pub audit: ShopAuditReport,
    #[serde(serialize_with = "money::serialize")]
    pub farmer_balance_total: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub buyer_balance_total: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub owner_commission_realized: Decimal,
}

/// Audit plus shop-wide totals, recorded in the audit log.
#[instrument(skip(conn), fields(shop_id = %shop_id))]
pub async fn generate_balance_report(
    conn: &mut PgConnection,
    shop_id: Uuid,
    actor_id: Option<Uuid>,
) -> Result<BalanceReport, SettlementError> {
    let audit_report = audit_shop_balances(&mut *conn, shop_id).await?;
    let shop = directory::get_shop(&mut *conn, shop_id).await?;

    let farmer_balance_total = audit_report
        .users
        .iter()
        .filter(|u| u.role == "farmer")
        .map(|u| u.current_balance)
        .sum();
    let buyer_balance_total = audit_report
        .users
        .iter()
        .filter(|u| u.role == "buyer")
        .map(|u| u.current_balance)
        .sum();
    let owner_commission_realized = match shop.owner_id {
        Some(owner_id) => directory::get_user(&mut *conn, owner_id).await?.cumulative_value,
        None => Decimal::ZERO,
    };

    audit::record(
        &mut *conn,
        audit::AuditRecord {
            shop_id: Some(shop_id),
            actor_id,
            action: "balance_report_generated",
            entity_type: "shop",
            entity_id: Some(shop_id),
            old_values: None,
            new_values: json!({
                "is_healthy": audit_report.is_healthy,
                "summary": audit_report.summary,
                "farmer_balance_total": money::format_money(farmer_balance_total),
                "buyer_balance_total": money::format_money(buyer_balance_total),
                "owner_commission_realized": money::format_money(owner_commission_realized),
            }),
        },
    )
    .await?;

    Ok(BalanceReport {
        audit: audit_report,
        farmer_balance_total,
        buyer_balance_total,
        owner_commission_realized,
    })
}
