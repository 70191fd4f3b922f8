//! Spreading payments over outstanding transactions.
//!
//! Buyer payments settle `total_amount`, shop payments to farmers settle
//! `farmer_earning`. Only PAID allocations of the matching direction count
//! toward a transaction's settled total.

use crate::config::SettlementSettings;
use crate::error::SettlementError;
use crate::models::{Payment, PaymentDirection};
use crate::money;
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::{commission, db_error, transactions};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgConnection;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// What a transaction still owes one side of the sale.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OpenObligation {
    pub transaction_id: Uuid,
    pub obligation: Decimal,
    pub allocated: Decimal,
}

impl OpenObligation {
    pub fn outstanding(&self) -> Decimal {
        (self.obligation - self.allocated).max(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedAllocation {
    pub transaction_id: Uuid,
    #[serde(serialize_with = "money::serialize")]
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllocationPlan {
    pub allocations: Vec<PlannedAllocation>,
    pub unallocated: Decimal,
}

/// Allocate `amount` across `obligations` in order, capping each at its outstanding.
pub fn plan_allocation(amount: Decimal, obligations: &[OpenObligation]) -> AllocationPlan {
    let mut remaining = amount.max(Decimal::ZERO);
    let mut allocations = Vec::new();

    for obligation in obligations {
        if remaining <= Decimal::ZERO {
            break;
        }
        let outstanding = obligation.outstanding();
        if outstanding <= Decimal::ZERO {
            continue;
        }
        let portion = remaining.min(outstanding);
        remaining -= portion;
        allocations.push(PlannedAllocation {
            transaction_id: obligation.transaction_id,
            amount: portion,
        });
    }

    AllocationPlan {
        allocations,
        unallocated: remaining,
    }
}

/// Which obligation of a transaction a payment direction settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObligationSide {
    Buyer,
    Farmer,
}

impl ObligationSide {
    pub fn for_direction(direction: PaymentDirection) -> Option<Self> {
        match direction {
            PaymentDirection::BuyerToShop => Some(Self::Buyer),
            PaymentDirection::ShopToFarmer => Some(Self::Farmer),
            _ => None,
        }
    }

    fn obligation_column(&self) -> &'static str {
        match self {
            Self::Buyer => "t.total_amount",
            Self::Farmer => "t.farmer_earning",
        }
    }

    fn party_column(&self) -> &'static str {
        match self {
            Self::Buyer => "t.buyer_id",
            Self::Farmer => "t.farmer_id",
        }
    }

    fn payment_filter(&self) -> &'static str {
        match self {
            Self::Buyer => "p.payer_type = 'BUYER' AND p.payee_type = 'SHOP'",
            Self::Farmer => "p.payer_type = 'SHOP' AND p.payee_type = 'FARMER'",
        }
    }

    fn obligations_sql(&self, filter: &str, lock: bool) -> String {
        format!(
            r#"
            SELECT t.transaction_id, {obligation} AS obligation,
                   COALESCE((SELECT SUM(a.allocated_amount)
                             FROM payment_allocations a
                             JOIN payments p ON p.payment_id = a.payment_id
                             WHERE a.transaction_id = t.transaction_id
                               AND p.status = 'PAID'
                               AND {payments}), 0) AS allocated
            FROM transactions t
            WHERE {filter}
            ORDER BY t.transaction_date, t.created_utc, t.seq
            {lock}
            "#,
            obligation = self.obligation_column(),
            payments = self.payment_filter(),
            filter = filter,
            lock = if lock { "FOR UPDATE OF t" } else { "" },
        )
    }
}

/// Obligations of one transaction.
pub async fn load_transaction_obligation(
    conn: &mut PgConnection,
    side: ObligationSide,
    transaction_id: Uuid,
    lock: bool,
) -> Result<Vec<OpenObligation>, SettlementError> {
    let sql = side.obligations_sql("t.transaction_id = $1", lock);
    sqlx::query_as::<_, OpenObligation>(&sql)
        .bind(transaction_id)
        .fetch_all(conn)
        .await
        .map_err(db_error("Failed to load transaction obligation"))
}

/// Obligations of every transaction a farmer or buyer took part in, oldest first.
pub async fn load_party_obligations(
    conn: &mut PgConnection,
    side: ObligationSide,
    shop_id: Uuid,
    user_id: Uuid,
    lock: bool,
) -> Result<Vec<OpenObligation>, SettlementError> {
    let filter = format!("t.shop_id = $1 AND {} = $2", side.party_column());
    let sql = side.obligations_sql(&filter, lock);
    sqlx::query_as::<_, OpenObligation>(&sql)
        .bind(shop_id)
        .bind(user_id)
        .fetch_all(conn)
        .await
        .map_err(db_error("Failed to load party obligations"))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationOutcome {
    pub allocations: Vec<PlannedAllocation>,
    #[serde(serialize_with = "money::serialize")]
    pub unallocated: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub commission_realized: Decimal,
    /// Allocations already existed; nothing was written.
    pub already_allocated: bool,
}

impl AllocationOutcome {
    fn nothing(unallocated: Decimal) -> Self {
        Self {
            allocations: Vec::new(),
            unallocated,
            commission_realized: Decimal::ZERO,
            already_allocated: false,
        }
    }

    pub fn allocated(&self) -> Decimal {
        self.allocations.iter().map(|a| a.amount).sum()
    }
}

/// Allocate a PAID payment to outstanding transactions. Idempotent per payment.
///
/// Linked payments go to their transaction only. Standalone shop-to-farmer
/// payments are spread over the farmer's transactions oldest first; standalone
/// buyer payments stay unallocated unless
/// [`SettlementSettings::allocate_standalone_buyer_payments`] is set.
#[instrument(skip(conn, payment, settings), fields(payment_id = %payment.payment_id, direction = payment.direction().as_str()))]
pub async fn allocate_payment_to_transactions(
    conn: &mut PgConnection,
    payment: &Payment,
    settings: &SettlementSettings,
    actor_id: Option<Uuid>,
) -> Result<AllocationOutcome, SettlementError> {
    if !payment.is_paid() {
        return Ok(AllocationOutcome::nothing(payment.amount));
    }
    let side = match ObligationSide::for_direction(payment.direction()) {
        Some(side) => side,
        None => return Ok(AllocationOutcome::nothing(payment.amount)),
    };

    let timer = DB_QUERY_DURATION
        .with_label_values(&["allocate_payment"])
        .start_timer();

    let existing: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM payment_allocations WHERE payment_id = $1")
            .bind(payment.payment_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(db_error("Failed to count existing allocations"))?;
    if existing > 0 {
        debug!(existing, "Payment already allocated");
        timer.observe_duration();
        return Ok(AllocationOutcome {
            already_allocated: true,
            ..AllocationOutcome::nothing(Decimal::ZERO)
        });
    }

    let obligations = match (payment.transaction_id, payment.counterparty_id) {
        (Some(transaction_id), _) => {
            load_transaction_obligation(&mut *conn, side, transaction_id, true).await?
        }
        (None, Some(user_id))
            if side == ObligationSide::Farmer || settings.allocate_standalone_buyer_payments =>
        {
            load_party_obligations(&mut *conn, side, payment.shop_id, user_id, true).await?
        }
        _ => Vec::new(),
    };

    let plan = plan_allocation(payment.amount, &obligations);
    let mut commission_realized = Decimal::ZERO;

    for allocation in &plan.allocations {
        sqlx::query(
            r#"
            INSERT INTO payment_allocations (allocation_id, payment_id, transaction_id, allocated_amount)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(payment.payment_id)
        .bind(allocation.transaction_id)
        .bind(allocation.amount)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to insert payment allocation"))?;

        if side == ObligationSide::Buyer {
            commission_realized += commission::realize_commission(
                &mut *conn,
                allocation.transaction_id,
                payment.payment_id,
                allocation.amount,
                actor_id,
            )
            .await?;
        }
    }

    if side == ObligationSide::Buyer {
        let mut touched: Vec<Uuid> = plan.allocations.iter().map(|a| a.transaction_id).collect();
        if let Some(transaction_id) = payment.transaction_id {
            if !touched.contains(&transaction_id) {
                touched.push(transaction_id);
            }
        }
        for transaction_id in touched {
            transactions::refresh_payment_status(&mut *conn, transaction_id).await?;
        }
    }

    timer.observe_duration();

    if plan.unallocated > Decimal::ZERO {
        info!(
            unallocated = %plan.unallocated,
            standalone = payment.is_standalone(),
            "Payment amount left unallocated"
        );
    }
    info!(
        allocations = plan.allocations.len(),
        commission = %commission_realized,
        "Payment allocated"
    );

    Ok(AllocationOutcome {
        allocations: plan.allocations,
        unallocated: plan.unallocated,
        commission_realized,
        already_allocated: false,
    })
}
