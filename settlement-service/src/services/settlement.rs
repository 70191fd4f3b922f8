//! Top-level settlement operations. Each call is one unit of work: it begins
//! a store transaction, runs the domain chain on it and commits, so any
//! failure leaves no trace.

use crate::config::SettlementSettings;
use crate::error::SettlementError;
use crate::models::{
    CreateExpense, CreateShop, CreateTransaction, CreateUser, Expense, ExpenseSettlement,
    LedgerEntry, NewPayment, PaymentStatus, Shop, Transaction, User, UserRole,
};
use crate::services::balance::{self, BalanceBreakdown, BalanceChange, RecomputeReason};
use crate::services::expenses::{self, ClawbackOutcome};
use crate::services::fifo::{self, RepaymentPlan};
use crate::services::guard::{self, GuardEvaluation};
use crate::services::metrics::record_payment;
use crate::services::payments::{self, PaymentReceipt};
use crate::services::reconciliation::{
    self, BalanceDrift, BalanceFix, BalanceReport, ShopAuditReport, UserReconciliation,
};
use crate::services::{db_error, directory, ledger, transactions, Database};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::{Postgres, Transaction as DbTransaction};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct RecordedTransaction {
    pub transaction: Transaction,
    pub farmer_balance: BalanceChange,
    pub buyer_balance: BalanceChange,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedExpense {
    pub expense: Expense,
    pub clawback: Option<ClawbackOutcome>,
    pub balance: BalanceChange,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualSettlement {
    pub expense: Expense,
    pub settlement: ExpenseSettlement,
    pub balance: BalanceChange,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpenseDetails {
    pub expense: Expense,
    pub settlements: Vec<ExpenseSettlement>,
}

#[derive(Clone)]
pub struct SettlementService {
    db: Arc<Database>,
    settings: SettlementSettings,
}

async fn commit(tx: DbTransaction<'static, Postgres>) -> Result<(), SettlementError> {
    tx.commit()
        .await
        .map_err(db_error("Failed to commit transaction"))
}

fn payment_outcome(result: &Result<PaymentReceipt, SettlementError>) -> &'static str {
    match result {
        Ok(receipt) if receipt.payment.is_paid() => "accepted",
        Ok(_) => "recorded",
        Err(SettlementError::DebtGuardRejection { .. }) => "blocked",
        Err(SettlementError::Validation(_)) | Err(SettlementError::NotFound { .. }) => "rejected",
        Err(SettlementError::Domain(_)) => "failed",
    }
}

impl SettlementService {
    pub fn new(db: Arc<Database>, settings: SettlementSettings) -> Self {
        Self { db, settings }
    }

    pub fn settings(&self) -> &SettlementSettings {
        &self.settings
    }

    async fn connection(&self) -> Result<PoolConnection<Postgres>, SettlementError> {
        self.db
            .pool()
            .acquire()
            .await
            .map_err(db_error("Failed to acquire connection"))
    }

    // =========================================================================
    // Participants
    // =========================================================================

    pub async fn create_shop(&self, input: &CreateShop) -> Result<(Shop, User), SettlementError> {
        let mut tx = self.db.begin().await?;
        let created = directory::create_shop(&mut *tx, input).await?;
        commit(tx).await?;
        Ok(created)
    }

    pub async fn create_user(&self, input: &CreateUser) -> Result<User, SettlementError> {
        let mut tx = self.db.begin().await?;
        let user = directory::create_user(&mut *tx, input).await?;
        commit(tx).await?;
        Ok(user)
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<User, SettlementError> {
        let mut conn = self.connection().await?;
        directory::get_user(&mut *conn, user_id).await
    }

    pub async fn get_shop(&self, shop_id: Uuid) -> Result<Shop, SettlementError> {
        let mut conn = self.connection().await?;
        directory::get_shop(&mut *conn, shop_id).await
    }

    pub async fn list_ledger_entries(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, SettlementError> {
        let mut conn = self.connection().await?;
        directory::get_user(&mut *conn, user_id).await?;
        ledger::list_entries(&mut *conn, user_id, limit).await
    }

    // =========================================================================
    // Sales
    // =========================================================================

    #[instrument(skip(self, input), fields(shop_id = %input.shop_id))]
    pub async fn create_transaction(
        &self,
        input: &CreateTransaction,
    ) -> Result<RecordedTransaction, SettlementError> {
        let mut tx = self.db.begin().await?;
        let transaction = transactions::create_transaction(&mut *tx, input).await?;

        let reason = RecomputeReason::new("transaction")
            .referencing("transaction", transaction.transaction_id)
            .for_transaction(Some(transaction.transaction_id));
        let farmer_balance =
            balance::recompute_balance(&mut *tx, transaction.farmer_id, &reason).await?;
        let buyer_balance =
            balance::recompute_balance(&mut *tx, transaction.buyer_id, &reason).await?;

        commit(tx).await?;
        Ok(RecordedTransaction {
            transaction,
            farmer_balance,
            buyer_balance,
        })
    }

    pub async fn get_transaction(&self, transaction_id: Uuid) -> Result<Transaction, SettlementError> {
        let mut conn = self.connection().await?;
        transactions::get_transaction(&mut *conn, transaction_id).await
    }

    // =========================================================================
    // Payments
    // =========================================================================

    pub async fn create_payment(
        &self,
        payment: &NewPayment,
        actor_id: Option<Uuid>,
    ) -> Result<PaymentReceipt, SettlementError> {
        let direction = payment.direction();
        let result = async {
            let mut tx = self.db.begin().await?;
            let receipt =
                payments::create_payment(&mut *tx, payment, &self.settings, actor_id).await?;
            commit(tx).await?;
            Ok::<_, SettlementError>(receipt)
        }
        .await;
        record_payment(direction.as_str(), payment_outcome(&result));
        result
    }

    pub async fn update_payment_status(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        actor_id: Option<Uuid>,
    ) -> Result<PaymentReceipt, SettlementError> {
        let result = async {
            let mut tx = self.db.begin().await?;
            let receipt = payments::update_payment_status(
                &mut *tx,
                payment_id,
                status,
                &self.settings,
                actor_id,
            )
            .await?;
            commit(tx).await?;
            Ok::<_, SettlementError>(receipt)
        }
        .await;
        if let Ok(receipt) = &result {
            record_payment(receipt.payment.direction().as_str(), payment_outcome(&result));
        }
        result
    }

    pub async fn get_payment(&self, payment_id: Uuid) -> Result<PaymentReceipt, SettlementError> {
        let mut conn = self.connection().await?;
        let payment = payments::get_payment(&mut *conn, payment_id, false).await?;
        let allocations = payments::list_allocations(&mut *conn, payment_id).await?;
        Ok(PaymentReceipt {
            payment,
            allocations,
            guard: None,
            outcome: None,
        })
    }

    /// Run the guard on its own. Nothing is written.
    pub async fn will_shop_to_farmer_worsen_debt(
        &self,
        shop_id: Uuid,
        farmer_id: Uuid,
        amount: Decimal,
        force_override: bool,
    ) -> Result<GuardEvaluation, SettlementError> {
        let mut tx = self.db.begin().await?;
        directory::expect_member(&mut *tx, shop_id, farmer_id, UserRole::Farmer, "farmer_id")
            .await?;
        guard::will_shop_to_farmer_worsen_debt(&mut *tx, shop_id, farmer_id, amount, force_override)
            .await
    }

    /// FIFO repayment of a user's expenses. A dry run rolls back; a real run
    /// also recomputes the user's balance.
    pub async fn apply_repayment_fifo(
        &self,
        shop_id: Uuid,
        user_id: Uuid,
        amount: Decimal,
        payment_id: Option<Uuid>,
        dry_run: bool,
    ) -> Result<RepaymentPlan, SettlementError> {
        let mut tx = self.db.begin().await?;
        directory::get_shop(&mut *tx, shop_id).await?;
        directory::lock_user(&mut *tx, user_id).await?;
        let plan =
            fifo::apply_repayment_fifo(&mut *tx, shop_id, user_id, amount, payment_id, dry_run)
                .await?;
        if dry_run {
            return Ok(plan);
        }

        let mut reason = RecomputeReason::new("fifo_repayment");
        if let Some(payment_id) = payment_id {
            reason = reason.referencing("payment", payment_id);
        }
        balance::recompute_balance(&mut *tx, user_id, &reason).await?;
        commit(tx).await?;
        Ok(plan)
    }

    // =========================================================================
    // Expenses
    // =========================================================================

    #[instrument(skip(self, input), fields(shop_id = %input.shop_id, user_id = %input.user_id))]
    pub async fn create_expense(
        &self,
        input: &CreateExpense,
        actor_id: Option<Uuid>,
    ) -> Result<RecordedExpense, SettlementError> {
        let mut tx = self.db.begin().await?;
        let expense = expenses::create_expense(&mut *tx, input, actor_id).await?;

        let user = directory::get_user(&mut *tx, expense.user_id).await?;
        let clawback = if user.parsed_role() == Some(UserRole::Farmer)
            && self.settings.expense_clawback_window_days > 0
        {
            Some(
                expenses::adjust_payments_for_expense(
                    &mut *tx,
                    expense.shop_id,
                    expense.user_id,
                    expense.amount,
                    expense.expense_id,
                    self.settings.expense_clawback_window_days,
                    actor_id,
                )
                .await?,
            )
        } else {
            None
        };

        let reason = RecomputeReason::new("expense")
            .referencing("expense", expense.expense_id)
            .for_transaction(expense.transaction_id);
        let balance = balance::recompute_balance(&mut *tx, expense.user_id, &reason).await?;

        commit(tx).await?;
        Ok(RecordedExpense {
            expense,
            clawback,
            balance,
        })
    }

    pub async fn settle_expense_amount(
        &self,
        expense_id: Uuid,
        amount: Decimal,
        notes: Option<String>,
    ) -> Result<ManualSettlement, SettlementError> {
        let mut tx = self.db.begin().await?;
        let (expense, settlement) =
            expenses::settle_expense_amount(&mut *tx, expense_id, amount, notes).await?;

        let reason = RecomputeReason::new("expense_settlement")
            .referencing("expense", expense.expense_id)
            .for_transaction(expense.transaction_id);
        let balance = balance::recompute_balance(&mut *tx, expense.user_id, &reason).await?;

        commit(tx).await?;
        Ok(ManualSettlement {
            expense,
            settlement,
            balance,
        })
    }

    pub async fn get_expense(&self, expense_id: Uuid) -> Result<ExpenseDetails, SettlementError> {
        let mut conn = self.connection().await?;
        let expense = expenses::get_expense(&mut *conn, expense_id, false).await?;
        let settlements = expenses::list_settlements(&mut *conn, expense_id).await?;
        Ok(ExpenseDetails {
            expense,
            settlements,
        })
    }

    // =========================================================================
    // Balances
    // =========================================================================

    pub async fn recompute_balance(&self, user_id: Uuid) -> Result<BalanceChange, SettlementError> {
        let mut tx = self.db.begin().await?;
        let change =
            balance::recompute_balance(&mut *tx, user_id, &RecomputeReason::new("manual_recompute"))
                .await?;
        commit(tx).await?;
        Ok(change)
    }

    pub async fn balance_breakdown(&self, user_id: Uuid) -> Result<BalanceBreakdown, SettlementError> {
        let mut conn = self.connection().await?;
        let user = directory::get_user(&mut *conn, user_id).await?;
        balance::compute_breakdown(&mut *conn, &user).await
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    pub async fn reconcile_user_balance(
        &self,
        user_id: Uuid,
    ) -> Result<UserReconciliation, SettlementError> {
        let mut conn = self.connection().await?;
        reconciliation::reconcile_user_balance(&mut *conn, user_id).await
    }

    pub async fn audit_shop_balances(&self, shop_id: Uuid) -> Result<ShopAuditReport, SettlementError> {
        let mut conn = self.connection().await?;
        reconciliation::audit_shop_balances(&mut *conn, shop_id).await
    }

    pub async fn fix_user_balance_discrepancy(
        &self,
        user_id: Uuid,
        actor_id: Option<Uuid>,
    ) -> Result<BalanceFix, SettlementError> {
        let mut tx = self.db.begin().await?;
        let fix = reconciliation::fix_user_balance_discrepancy(&mut *tx, user_id, actor_id).await?;
        commit(tx).await?;
        Ok(fix)
    }

    pub async fn find_drifted_users(&self, shop_id: Uuid) -> Result<Vec<BalanceDrift>, SettlementError> {
        let mut conn = self.connection().await?;
        reconciliation::find_drifted_users(&mut *conn, shop_id).await
    }

    pub async fn generate_balance_report(
        &self,
        shop_id: Uuid,
        actor_id: Option<Uuid>,
    ) -> Result<BalanceReport, SettlementError> {
        let mut tx = self.db.begin().await?;
        let report = reconciliation::generate_balance_report(&mut *tx, shop_id, actor_id).await?;
        commit(tx).await?;
        Ok(report)
    }
}
