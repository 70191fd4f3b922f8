//! Oldest-first repayment of outstanding expenses.
//!
//! [`plan_repayment`] is the side-effect-free core; [`apply_repayment_fifo`]
//! loads the user's pending expenses, plans, and (unless dry-running) writes
//! settlement rows and status changes on the caller's connection.

use crate::error::SettlementError;
use crate::money;
use crate::services::db_error;
use crate::services::metrics::DB_QUERY_DURATION;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgConnection;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// A pending expense and how much of it has been settled so far.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OutstandingExpense {
    pub expense_id: Uuid,
    pub amount: Decimal,
    pub settled: Decimal,
}

impl OutstandingExpense {
    pub fn remaining(&self) -> Decimal {
        (self.amount - self.settled).max(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedSettlement {
    pub expense_id: Uuid,
    #[serde(serialize_with = "money::serialize")]
    pub amount: Decimal,
    /// The expense has nothing left to settle after this portion.
    pub fully_settled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepaymentPlan {
    /// Portion of the repayment left over for the balance.
    #[serde(serialize_with = "money::serialize")]
    pub remaining: Decimal,
    pub settlements: Vec<PlannedSettlement>,
}

impl RepaymentPlan {
    fn untouched(amount: Decimal) -> Self {
        Self {
            remaining: amount,
            settlements: Vec::new(),
        }
    }

    /// Portion of the repayment consumed by expenses.
    pub fn applied(&self) -> Decimal {
        self.settlements.iter().map(|s| s.amount).sum()
    }
}

/// Consume `amount` against `expenses` in the given order (oldest first).
pub fn plan_repayment(amount: Decimal, expenses: &[OutstandingExpense]) -> RepaymentPlan {
    if amount <= Decimal::ZERO {
        return RepaymentPlan::untouched(amount);
    }

    let mut remaining = amount;
    let mut settlements = Vec::new();

    for expense in expenses {
        if remaining <= Decimal::ZERO {
            break;
        }
        let open = expense.remaining();
        if open <= Decimal::ZERO {
            continue;
        }
        let portion = remaining.min(open);
        remaining -= portion;
        settlements.push(PlannedSettlement {
            expense_id: expense.expense_id,
            amount: portion,
            fully_settled: portion >= open,
        });
    }

    RepaymentPlan {
        remaining,
        settlements,
    }
}

/// Apply a repayment from `user_id` to its oldest pending expenses in `shop_id`.
///
/// With `dry_run` the same plan is computed from the same rows but nothing is
/// written and no row locks are taken, so it can run inside the transaction
/// that later performs the real write.
#[instrument(skip(conn), fields(shop_id = %shop_id, user_id = %user_id, amount = %amount))]
pub async fn apply_repayment_fifo(
    conn: &mut PgConnection,
    shop_id: Uuid,
    user_id: Uuid,
    amount: Decimal,
    payment_id: Option<Uuid>,
    dry_run: bool,
) -> Result<RepaymentPlan, SettlementError> {
    if amount <= Decimal::ZERO {
        return Ok(RepaymentPlan::untouched(amount));
    }

    let timer = DB_QUERY_DURATION
        .with_label_values(&["apply_repayment_fifo"])
        .start_timer();

    if !dry_run {
        sqlx::query(
            r#"
            SELECT expense_id FROM expenses
            WHERE shop_id = $1 AND user_id = $2 AND status = 'pending'
            ORDER BY created_utc, seq
            FOR UPDATE
            "#,
        )
        .bind(shop_id)
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error("Failed to lock pending expenses"))?;
    }

    let expenses = load_outstanding_expenses(&mut *conn, shop_id, user_id).await?;
    let plan = plan_repayment(amount, &expenses);

    debug!(
        expenses = expenses.len(),
        settlements = plan.settlements.len(),
        remaining = %plan.remaining,
        dry_run,
        "Planned FIFO repayment"
    );

    if !dry_run {
        let notes = payment_id.map(|id| format!("Settled by payment {}", id));
        for settlement in &plan.settlements {
            sqlx::query(
                r#"
                INSERT INTO expense_settlements (settlement_id, expense_id, payment_id, amount, notes)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(settlement.expense_id)
            .bind(payment_id)
            .bind(settlement.amount)
            .bind(&notes)
            .execute(&mut *conn)
            .await
            .map_err(db_error("Failed to record expense settlement"))?;

            if settlement.fully_settled {
                mark_expense_settled(&mut *conn, settlement.expense_id).await?;
            }
        }

        if !plan.settlements.is_empty() {
            info!(
                applied = %plan.applied(),
                remaining = %plan.remaining,
                "Repayment applied to expenses"
            );
        }
    }

    timer.observe_duration();

    Ok(plan)
}

/// Pending expenses for a user, oldest first, with settled totals batch-loaded.
pub async fn load_outstanding_expenses(
    conn: &mut PgConnection,
    shop_id: Uuid,
    user_id: Uuid,
) -> Result<Vec<OutstandingExpense>, SettlementError> {
    sqlx::query_as::<_, OutstandingExpense>(
        r#"
        SELECT e.expense_id, e.amount,
               COALESCE((SELECT SUM(s.amount) FROM expense_settlements s
                         WHERE s.expense_id = e.expense_id), 0) AS settled
        FROM expenses e
        WHERE e.shop_id = $1 AND e.user_id = $2 AND e.status = 'pending'
        ORDER BY e.created_utc, e.seq
        "#,
    )
    .bind(shop_id)
    .bind(user_id)
    .fetch_all(conn)
    .await
    .map_err(db_error("Failed to load pending expenses"))
}

pub(crate) async fn mark_expense_settled(
    conn: &mut PgConnection,
    expense_id: Uuid,
) -> Result<(), SettlementError> {
    sqlx::query("UPDATE expenses SET status = 'settled' WHERE expense_id = $1")
        .bind(expense_id)
        .execute(conn)
        .await
        .map_err(db_error("Failed to mark expense settled"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn expense(amount: Decimal, settled: Decimal) -> OutstandingExpense {
        OutstandingExpense {
            expense_id: Uuid::new_v4(),
            amount,
            settled,
        }
    }

    #[test]
    fn settles_oldest_first_and_leaves_partial_remainder() {
        let older = expense(dec!(10), dec!(0));
        let newer = expense(dec!(5), dec!(0));
        let plan = plan_repayment(dec!(12), &[older.clone(), newer.clone()]);

        assert_eq!(plan.remaining, dec!(0));
        assert_eq!(plan.settlements.len(), 2);
        assert_eq!(plan.settlements[0].expense_id, older.expense_id);
        assert_eq!(plan.settlements[0].amount, dec!(10));
        assert!(plan.settlements[0].fully_settled);
        assert_eq!(plan.settlements[1].expense_id, newer.expense_id);
        assert_eq!(plan.settlements[1].amount, dec!(2));
        assert!(!plan.settlements[1].fully_settled);
    }

    #[test]
    fn leftover_goes_to_balance() {
        let plan = plan_repayment(dec!(50), &[expense(dec!(30), dec!(0))]);
        assert_eq!(plan.applied(), dec!(30));
        assert_eq!(plan.remaining, dec!(20));
    }

    #[test]
    fn respects_previous_settlements() {
        let plan = plan_repayment(dec!(10), &[expense(dec!(10), dec!(7)), expense(dec!(4), dec!(0))]);
        assert_eq!(plan.settlements[0].amount, dec!(3));
        assert!(plan.settlements[0].fully_settled);
        assert_eq!(plan.settlements[1].amount, dec!(4));
        assert_eq!(plan.remaining, dec!(3));
    }

    #[test]
    fn zero_amount_and_no_expenses_are_no_ops() {
        let plan = plan_repayment(dec!(0), &[expense(dec!(10), dec!(0))]);
        assert_eq!(plan.remaining, dec!(0));
        assert!(plan.settlements.is_empty());

        let plan = plan_repayment(dec!(25), &[]);
        assert_eq!(plan.remaining, dec!(25));
        assert!(plan.settlements.is_empty());
    }

    #[test]
    fn fully_settled_leftovers_are_skipped() {
        let plan = plan_repayment(dec!(5), &[expense(dec!(10), dec!(10)), expense(dec!(3), dec!(0))]);
        assert_eq!(plan.settlements.len(), 1);
        assert_eq!(plan.settlements[0].amount, dec!(3));
        assert_eq!(plan.remaining, dec!(2));
    }

    fn cents() -> impl Strategy<Value = Decimal> {
        (1i64..1_000_000i64).prop_map(|n| Decimal::new(n, 2))
    }

    fn expenses_strategy() -> impl Strategy<Value = Vec<OutstandingExpense>> {
        prop::collection::vec(
            (cents(), 0u32..=100u32).prop_map(|(amount, pct)| {
                let settled = money::round_money(amount * Decimal::from(pct) / Decimal::ONE_HUNDRED);
                expense(amount, settled)
            }),
            0..12,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_never_over_settles_an_expense(amount in cents(), expenses in expenses_strategy()) {
            let plan = plan_repayment(amount, &expenses);
            for settlement in &plan.settlements {
                let source = expenses.iter().find(|e| e.expense_id == settlement.expense_id).unwrap();
                prop_assert!(settlement.amount > Decimal::ZERO);
                prop_assert!(source.settled + settlement.amount <= source.amount);
            }
        }

        #[test]
        fn prop_amount_is_conserved(amount in cents(), expenses in expenses_strategy()) {
            let plan = plan_repayment(amount, &expenses);
            prop_assert_eq!(plan.applied() + plan.remaining, amount);
            prop_assert!(plan.remaining >= Decimal::ZERO);
        }

        #[test]
        fn prop_planning_is_deterministic(amount in cents(), expenses in expenses_strategy()) {
            let first = plan_repayment(amount, &expenses);
            let second = plan_repayment(amount, &expenses);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_only_last_settlement_may_be_partial(amount in cents(), expenses in expenses_strategy()) {
            let plan = plan_repayment(amount, &expenses);
            if plan.settlements.len() > 1 {
                for settlement in &plan.settlements[..plan.settlements.len() - 1] {
                    prop_assert!(settlement.fully_settled);
                }
            }
        }
    }
}
