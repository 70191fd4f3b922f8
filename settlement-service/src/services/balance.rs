//! Balance recalculation: the only path that writes `users.balance` during
//! normal operation.
//!
//! Balances are always re-derived from transactions, allocations, expenses
//! and payments; they are never adjusted by deltas. Every change appends one
//! ledger entry and one snapshot so the ledger sum keeps tracking the
//! stored value.

use crate::error::SettlementError;
use crate::models::{NewLedgerEntry, User, UserRole};
use crate::money;
use crate::services::allocation::{self, ObligationSide, OpenObligation};
use crate::services::fifo::{self, OutstandingExpense};
use crate::services::ledger::{self, SnapshotReason};
use crate::services::metrics::{record_recompute, DB_QUERY_DURATION};
use crate::services::{db_error, directory};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgConnection;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Farmer: unpaid earnings minus unsettled expenses.
pub fn derive_farmer_balance(
    earnings: &[OpenObligation],
    expenses: &[OutstandingExpense],
) -> Decimal {
    let owed: Decimal = earnings.iter().map(OpenObligation::outstanding).sum();
    let debts: Decimal = expenses.iter().map(OutstandingExpense::remaining).sum();
    money::round_money(owed - debts)
}

/// Buyer: unpaid purchases minus refunds and unallocated standalone payments.
pub fn derive_buyer_balance(
    purchases: &[OpenObligation],
    refunds: Decimal,
    bookkeeping_credits: Decimal,
) -> Decimal {
    let owed: Decimal = purchases.iter().map(OpenObligation::outstanding).sum();
    money::round_money(owed - refunds - bookkeeping_credits)
}

/// Components of a derived balance.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceBreakdown {
    pub user_id: Uuid,
    pub role: UserRole,
    /// Unpaid farmer earnings or unpaid buyer purchases.
    #[serde(serialize_with = "money::serialize")]
    pub outstanding_transactions: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub outstanding_expenses: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub refunds: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub bookkeeping_credits: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub derived_balance: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub stored_balance: Decimal,
}

/// Derive a user's balance from first principles without writing anything.
pub async fn compute_breakdown(
    conn: &mut PgConnection,
    user: &User,
) -> Result<BalanceBreakdown, SettlementError> {
    let role = user.parsed_role().ok_or_else(|| {
        SettlementError::Domain(anyhow::anyhow!(
            "User {} has unknown role '{}'",
            user.user_id,
            user.role
        ))
    })?;

    let mut breakdown = BalanceBreakdown {
        user_id: user.user_id,
        role,
        outstanding_transactions: Decimal::ZERO,
        outstanding_expenses: Decimal::ZERO,
        refunds: Decimal::ZERO,
        bookkeeping_credits: Decimal::ZERO,
        derived_balance: user.balance,
        stored_balance: user.balance,
    };

    let shop_id = match (role, user.shop_id) {
        (UserRole::Owner, _) | (_, None) => return Ok(breakdown),
        (_, Some(shop_id)) => shop_id,
    };

    match role {
        UserRole::Farmer => {
            let earnings = allocation::load_party_obligations(
                &mut *conn,
                ObligationSide::Farmer,
                shop_id,
                user.user_id,
                false,
            )
            .await?;
            let expenses = fifo::load_outstanding_expenses(&mut *conn, shop_id, user.user_id).await?;

            breakdown.outstanding_transactions =
                earnings.iter().map(OpenObligation::outstanding).sum();
            breakdown.outstanding_expenses =
                expenses.iter().map(OutstandingExpense::remaining).sum();
            breakdown.derived_balance = derive_farmer_balance(&earnings, &expenses);
        }
        UserRole::Buyer => {
            let purchases = allocation::load_party_obligations(
                &mut *conn,
                ObligationSide::Buyer,
                shop_id,
                user.user_id,
                false,
            )
            .await?;
            let refunds = buyer_refunds(&mut *conn, shop_id, user.user_id).await?;
            let credits = buyer_bookkeeping_credits(&mut *conn, shop_id, user.user_id).await?;

            breakdown.outstanding_transactions =
                purchases.iter().map(OpenObligation::outstanding).sum();
            breakdown.refunds = refunds;
            breakdown.bookkeeping_credits = credits;
            breakdown.derived_balance = derive_buyer_balance(&purchases, refunds, credits);
        }
        UserRole::Owner => {}
    }

    Ok(breakdown)
}

async fn buyer_refunds(
    conn: &mut PgConnection,
    shop_id: Uuid,
    buyer_id: Uuid,
) -> Result<Decimal, SettlementError> {
    sqlx::query_scalar::<_, Decimal>(
        r#"
        SELECT COALESCE(SUM(amount), 0) FROM payments
        WHERE shop_id = $1 AND counterparty_id = $2 AND status = 'PAID'
          AND payer_type = 'SHOP' AND payee_type = 'BUYER'
        "#,
    )
    .bind(shop_id)
    .bind(buyer_id)
    .fetch_one(conn)
    .await
    .map_err(db_error("Failed to sum buyer refunds"))
}

/// Unallocated remainder of standalone buyer payments.
async fn buyer_bookkeeping_credits(
    conn: &mut PgConnection,
    shop_id: Uuid,
    buyer_id: Uuid,
) -> Result<Decimal, SettlementError> {
    sqlx::query_scalar::<_, Decimal>(
        r#"
        SELECT COALESCE(SUM(p.amount - COALESCE((SELECT SUM(a.allocated_amount)
                                                 FROM payment_allocations a
                                                 WHERE a.payment_id = p.payment_id), 0)), 0)
        FROM payments p
        WHERE p.shop_id = $1 AND p.counterparty_id = $2 AND p.status = 'PAID'
          AND p.payer_type = 'BUYER' AND p.payee_type = 'SHOP'
          AND p.transaction_id IS NULL
        "#,
    )
    .bind(shop_id)
    .bind(buyer_id)
    .fetch_one(conn)
    .await
    .map_err(db_error("Failed to sum buyer bookkeeping credits"))
}

/// What triggered a recompute; lands on the ledger entry and snapshot.
#[derive(Debug, Clone)]
pub struct RecomputeReason {
    pub code: &'static str,
    pub reference_type: Option<&'static str>,
    pub reference_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
}

impl RecomputeReason {
    pub fn new(code: &'static str) -> Self {
        Self {
            code,
            reference_type: None,
            reference_id: None,
            transaction_id: None,
        }
    }

    pub fn referencing(mut self, reference_type: &'static str, reference_id: Uuid) -> Self {
        self.reference_type = Some(reference_type);
        self.reference_id = Some(reference_id);
        self
    }

    pub fn for_transaction(mut self, transaction_id: Option<Uuid>) -> Self {
        self.transaction_id = transaction_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceChange {
    pub user_id: Uuid,
    #[serde(serialize_with = "money::serialize")]
    pub previous_balance: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub new_balance: Decimal,
}

impl BalanceChange {
    pub fn delta(&self) -> Decimal {
        self.new_balance - self.previous_balance
    }
}

/// Re-derive and persist a user's balance inside the caller's transaction.
///
/// Locks the user row first. Owners are left untouched.
#[instrument(skip(conn, reason), fields(user_id = %user_id, reason = reason.code))]
pub async fn recompute_balance(
    conn: &mut PgConnection,
    user_id: Uuid,
    reason: &RecomputeReason,
) -> Result<BalanceChange, SettlementError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["recompute_balance"])
        .start_timer();

    let user = directory::lock_user(&mut *conn, user_id).await?;
    let breakdown = compute_breakdown(&mut *conn, &user).await?;
    let previous = user.balance;
    let derived = breakdown.derived_balance;

    let change = BalanceChange {
        user_id,
        previous_balance: previous,
        new_balance: derived,
    };

    if derived == previous {
        timer.observe_duration();
        record_recompute(breakdown.role.as_str(), false);
        debug!(balance = %previous, "Balance unchanged");
        return Ok(change);
    }

    sqlx::query("UPDATE users SET balance = $1 WHERE user_id = $2")
        .bind(derived)
        .bind(user_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to update balance"))?;

    ledger::append_entry(
        &mut *conn,
        NewLedgerEntry {
            shop_id: user.shop_id,
            transaction_id: reason.transaction_id,
            user_id,
            role: user.role.clone(),
            delta_amount: change.delta(),
            balance_before: previous,
            balance_after: derived,
            reason_code: reason.code.to_string(),
        },
    )
    .await?;

    ledger::record_snapshot(
        &mut *conn,
        user_id,
        previous,
        derived,
        &SnapshotReason {
            reason: reason.code.to_string(),
            reference_type: reason.reference_type,
            reference_id: reason.reference_id,
        },
    )
    .await?;

    timer.observe_duration();
    record_recompute(breakdown.role.as_str(), true);
    info!(
        previous_balance = %previous,
        new_balance = %derived,
        "Balance recomputed"
    );

    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn earning(obligation: Decimal, allocated: Decimal) -> OpenObligation {
        OpenObligation {
            transaction_id: Uuid::new_v4(),
            obligation,
            allocated,
        }
    }

    fn expense(amount: Decimal, settled: Decimal) -> OutstandingExpense {
        OutstandingExpense {
            expense_id: Uuid::new_v4(),
            amount,
            settled,
        }
    }

    #[test]
    fn farmer_balance_nets_expenses_against_unpaid_earnings() {
        let balance = derive_farmer_balance(
            &[earning(dec!(950), dec!(0)), earning(dec!(400), dec!(100))],
            &[expense(dec!(10), dec!(0)), expense(dec!(5), dec!(2))],
        );
        assert_eq!(balance, dec!(1237));
    }

    #[test]
    fn farmer_overpayment_does_not_go_negative_per_transaction() {
        let balance = derive_farmer_balance(&[earning(dec!(100), dec!(150))], &[]);
        assert_eq!(balance, dec!(0));
    }

    #[test]
    fn farmer_with_only_expenses_is_in_debt() {
        let balance = derive_farmer_balance(&[], &[expense(dec!(100), dec!(0))]);
        assert_eq!(balance, dec!(-100));
    }

    #[test]
    fn buyer_balance_subtracts_refunds_and_credits() {
        let balance = derive_buyer_balance(
            &[earning(dec!(1000), dec!(300)), earning(dec!(200), dec!(0))],
            dec!(50),
            dec!(100),
        );
        assert_eq!(balance, dec!(750));
    }

    #[test]
    fn expense_settlement_raises_farmer_balance_by_its_amount() {
        let earnings = [earning(dec!(1300), dec!(0))];
        let before = derive_farmer_balance(&earnings, &[expense(dec!(300), dec!(0))]);
        let after = derive_farmer_balance(&earnings, &[expense(dec!(300), dec!(300))]);
        assert_eq!(after - before, dec!(300));
    }

    #[test]
    fn reason_builder() {
        let id = Uuid::new_v4();
        let reason = RecomputeReason::new("payment")
            .referencing("payment", id)
            .for_transaction(None);
        assert_eq!(reason.code, "payment");
        assert_eq!(reason.reference_id, Some(id));
        assert_eq!(reason.transaction_id, None);
    }
}
