//! Debt-worsening guard for shop-to-farmer payments.

use crate::error::SettlementError;
use crate::money;
use crate::services::metrics::record_guard_decision;
use crate::services::{directory, fifo};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgConnection;
use tracing::{instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GuardDecision {
    Allow,
    Block,
}

impl GuardDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardEvaluation {
    pub decision: GuardDecision,
    /// `true` when the payment would create or deepen farmer debt and no
    /// override was given.
    pub worsen: bool,
    /// `true` when an override let a debt-worsening payment through.
    pub overridden: bool,
    #[serde(serialize_with = "money::serialize")]
    pub current_balance: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub simulated_new_balance: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub remaining_for_balance: Decimal,
    pub force_override: bool,
}

impl GuardEvaluation {
    pub fn into_rejection(self) -> SettlementError {
        SettlementError::DebtGuardRejection {
            current_balance: self.current_balance,
            simulated_new_balance: self.simulated_new_balance,
        }
    }
}

/// Decide whether a shop-to-farmer payment may proceed.
///
/// A farmer already in debt is always blocked. Otherwise the payment is
/// blocked only if, after expense settlement, it lowers the balance below
/// zero. `force_override` allows unconditionally and clears `worsen`.
pub fn evaluate(
    current_balance: Decimal,
    remaining_for_balance: Decimal,
    force_override: bool,
) -> GuardEvaluation {
    let simulated_new_balance = current_balance - remaining_for_balance;
    let would_worsen = current_balance < Decimal::ZERO
        || (simulated_new_balance < current_balance && simulated_new_balance < Decimal::ZERO);
    let decision = if force_override || !would_worsen {
        GuardDecision::Allow
    } else {
        GuardDecision::Block
    };

    GuardEvaluation {
        decision,
        worsen: would_worsen && !force_override,
        overridden: would_worsen && force_override,
        current_balance,
        simulated_new_balance,
        remaining_for_balance,
        force_override,
    }
}

/// Evaluate a shop-to-farmer payment against the farmer's stored balance.
///
/// Runs FIFO in dry-run mode on the caller's connection, so it can precede
/// the real write inside the same transaction. The farmer row is locked
/// first; concurrent payments to the same farmer evaluate one at a time.
#[instrument(skip(conn), fields(shop_id = %shop_id, farmer_id = %farmer_id, amount = %amount, force_override))]
pub async fn will_shop_to_farmer_worsen_debt(
    conn: &mut PgConnection,
    shop_id: Uuid,
    farmer_id: Uuid,
    amount: Decimal,
    force_override: bool,
) -> Result<GuardEvaluation, SettlementError> {
    let farmer = directory::lock_user(&mut *conn, farmer_id).await?;
    let plan = fifo::apply_repayment_fifo(&mut *conn, shop_id, farmer_id, amount, None, true).await?;
    let evaluation = evaluate(farmer.balance, plan.remaining, force_override);

    record_guard_decision(evaluation.decision.as_str());
    if evaluation.decision == GuardDecision::Block {
        warn!(
            current_balance = %evaluation.current_balance,
            simulated_new_balance = %evaluation.simulated_new_balance,
            "Shop-to-farmer payment blocked"
        );
    } else if evaluation.overridden {
        warn!(
            current_balance = %evaluation.current_balance,
            simulated_new_balance = %evaluation.simulated_new_balance,
            "Debt-worsening payment allowed by override"
        );
    }

    Ok(evaluation)
}
