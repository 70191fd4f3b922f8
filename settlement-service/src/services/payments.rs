//! Payment intake: validation, the debt guard, persistence and the
//! post-processing chain (allocation, expense FIFO, recompute).

use crate::config::SettlementSettings;
use crate::error::{FieldError, SettlementError};
use crate::models::{
    NewPayment, PartyType, Payment, PaymentAllocation, PaymentDirection, PaymentStatus, UserRole,
};
use crate::money;
use crate::services::allocation::{self, AllocationOutcome};
use crate::services::balance::{self, BalanceChange, RecomputeReason};
use crate::services::fifo::{self, PlannedSettlement};
use crate::services::guard::{self, GuardDecision, GuardEvaluation};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::{audit, db_error, directory, transactions};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use sqlx::PgConnection;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const PAYMENT_COLUMNS: &str = "payment_id, shop_id, transaction_id, counterparty_id, payer_type, \
     payee_type, amount, method, status, force_override, notes, payment_date, applied_to_expenses, \
     applied_to_balance, balance_before, balance_after, created_by, created_utc";

/// Checks that need no store access.
pub fn validate_payment(payment: &NewPayment) -> Result<(), SettlementError> {
    let mut errors = Vec::new();
    if money::round_money(payment.amount) <= Decimal::ZERO {
        errors.push(FieldError::new("amount", "must be at least 0.01"));
    }
    if payment.payer_type == PartyType::Shop && payment.payee_type == PartyType::Shop {
        errors.push(FieldError::new("payee_type", "shop-to-shop payments are not allowed"));
    }
    if payment.shop_id.is_none() && payment.transaction_id.is_none() {
        errors.push(FieldError::new("shop_id", "required when no transaction is given"));
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(SettlementError::Validation(errors))
    }
}

/// Role the counterparty must hold for a direction.
pub fn counterparty_role(direction: PaymentDirection) -> Option<UserRole> {
    match direction {
        PaymentDirection::BuyerToShop | PaymentDirection::ShopToBuyer => Some(UserRole::Buyer),
        PaymentDirection::ShopToFarmer | PaymentDirection::FarmerToShop => Some(UserRole::Farmer),
        PaymentDirection::Other => None,
    }
}

/// Shop and counterparty after filling gaps from the linked transaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedParties {
    pub shop_id: Uuid,
    pub counterparty_id: Option<Uuid>,
}

#[instrument(skip(conn, payment), fields(direction = payment.direction().as_str()))]
pub async fn resolve_parties(
    conn: &mut PgConnection,
    payment: &NewPayment,
) -> Result<ResolvedParties, SettlementError> {
    let direction = payment.direction();
    let role = counterparty_role(direction);

    let (shop_id, counterparty_id) = match payment.transaction_id {
        Some(transaction_id) => {
            let transaction = transactions::get_transaction(&mut *conn, transaction_id).await?;
            if payment.shop_id.is_some_and(|shop_id| shop_id != transaction.shop_id) {
                return Err(SettlementError::invalid(
                    "transaction_id",
                    "transaction belongs to a different shop",
                ));
            }
            let party = match role {
                Some(UserRole::Buyer) => Some(transaction.buyer_id),
                Some(UserRole::Farmer) => Some(transaction.farmer_id),
                _ => None,
            };
            if let (Some(given), Some(party)) = (payment.counterparty_id, party) {
                if given != party {
                    return Err(SettlementError::invalid(
                        "counterparty_id",
                        "does not match the transaction's party for this direction",
                    ));
                }
            }
            (transaction.shop_id, payment.counterparty_id.or(party))
        }
        None => match payment.shop_id {
            Some(shop_id) => (shop_id, payment.counterparty_id),
            None => return Err(SettlementError::invalid("shop_id", "required")),
        },
    };

    directory::get_shop(&mut *conn, shop_id).await?;

    match (role, counterparty_id) {
        (Some(role), Some(user_id)) => {
            directory::expect_member(&mut *conn, shop_id, user_id, role, "counterparty_id").await?;
        }
        (Some(role), None) => {
            return Err(SettlementError::invalid(
                "counterparty_id",
                format!("a {} is required for {} payments", role, direction.as_str()),
            ));
        }
        (None, Some(user_id)) => {
            let user = directory::get_user(&mut *conn, user_id).await?;
            if user.shop_id != Some(shop_id) {
                return Err(SettlementError::invalid(
                    "counterparty_id",
                    "user does not belong to this shop",
                ));
            }
        }
        (None, None) => {}
    }

    Ok(ResolvedParties {
        shop_id,
        counterparty_id,
    })
}

async fn insert_payment(
    conn: &mut PgConnection,
    payment: &NewPayment,
    parties: ResolvedParties,
    actor_id: Option<Uuid>,
) -> Result<Payment, SettlementError> {
    let sql = format!(
        r#"
        INSERT INTO payments
            (payment_id, shop_id, transaction_id, counterparty_id, payer_type, payee_type, amount,
             method, status, force_override, notes, payment_date, created_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, COALESCE($12, clock_timestamp()), $13)
        RETURNING {}
        "#,
        PAYMENT_COLUMNS
    );
    sqlx::query_as::<_, Payment>(&sql)
        .bind(Uuid::new_v4())
        .bind(parties.shop_id)
        .bind(payment.transaction_id)
        .bind(parties.counterparty_id)
        .bind(payment.payer_type.as_str())
        .bind(payment.payee_type.as_str())
        .bind(money::round_money(payment.amount))
        .bind(payment.method.as_str())
        .bind(payment.status.as_str())
        .bind(payment.force_override)
        .bind(&payment.notes)
        .bind(payment.payment_date)
        .bind(actor_id)
        .fetch_one(conn)
        .await
        .map_err(db_error("Failed to create payment"))
}

pub async fn get_payment(
    conn: &mut PgConnection,
    payment_id: Uuid,
    lock: bool,
) -> Result<Payment, SettlementError> {
    let sql = format!(
        "SELECT {} FROM payments WHERE payment_id = $1{}",
        PAYMENT_COLUMNS,
        if lock { " FOR UPDATE" } else { "" }
    );
    sqlx::query_as::<_, Payment>(&sql)
        .bind(payment_id)
        .fetch_optional(conn)
        .await
        .map_err(db_error("Failed to get payment"))?
        .ok_or_else(|| SettlementError::not_found("payment", payment_id))
}

pub async fn list_allocations(
    conn: &mut PgConnection,
    payment_id: Uuid,
) -> Result<Vec<PaymentAllocation>, SettlementError> {
    sqlx::query_as::<_, PaymentAllocation>(
        r#"
        SELECT allocation_id, payment_id, transaction_id, allocated_amount, created_utc
        FROM payment_allocations
        WHERE payment_id = $1
        ORDER BY created_utc, allocation_id
        "#,
    )
    .bind(payment_id)
    .fetch_all(conn)
    .await
    .map_err(db_error("Failed to list payment allocations"))
}

/// Effects of running a PAID payment through the settlement chain.
#[derive(Debug, Clone, Serialize)]
pub struct PostProcessOutcome {
    pub allocation: AllocationOutcome,
    pub expense_settlements: Vec<PlannedSettlement>,
    #[serde(serialize_with = "money::serialize")]
    pub applied_to_expenses: Decimal,
    #[serde(serialize_with = "money::serialize")]
    pub applied_to_balance: Decimal,
    pub balance: Option<BalanceChange>,
}

/// Allocate, settle expenses, recompute the counterparty and record the
/// payment's breakdown. Runs once per PAID payment.
#[instrument(skip(conn, payment, settings), fields(payment_id = %payment.payment_id))]
pub async fn post_process(
    conn: &mut PgConnection,
    payment: &Payment,
    settings: &SettlementSettings,
    actor_id: Option<Uuid>,
) -> Result<PostProcessOutcome, SettlementError> {
    let direction = payment.direction();

    let allocation =
        allocation::allocate_payment_to_transactions(&mut *conn, payment, settings, actor_id)
            .await?;

    let farmer = match (direction.settles_expenses(), payment.counterparty_id) {
        (true, Some(farmer_id)) => Some(farmer_id),
        _ => None,
    };
    let plan = match farmer {
        Some(farmer_id) => Some(
            fifo::apply_repayment_fifo(
                &mut *conn,
                payment.shop_id,
                farmer_id,
                payment.amount,
                Some(payment.payment_id),
                false,
            )
            .await?,
        ),
        None => None,
    };
    let applied_to_expenses = plan.as_ref().map(|p| p.applied()).unwrap_or(Decimal::ZERO);
    let applied_to_balance = payment.amount - applied_to_expenses;

    let balance = match payment.counterparty_id {
        Some(user_id) => {
            let reason = RecomputeReason::new("payment")
                .referencing("payment", payment.payment_id)
                .for_transaction(payment.transaction_id);
            Some(balance::recompute_balance(&mut *conn, user_id, &reason).await?)
        }
        None => None,
    };

    sqlx::query(
        r#"
        UPDATE payments
        SET applied_to_expenses = $1, applied_to_balance = $2, balance_before = $3, balance_after = $4
        WHERE payment_id = $5 AND applied_to_expenses IS NULL
        "#,
    )
    .bind(applied_to_expenses)
    .bind(applied_to_balance)
    .bind(balance.as_ref().map(|b| b.previous_balance))
    .bind(balance.as_ref().map(|b| b.new_balance))
    .bind(payment.payment_id)
    .execute(&mut *conn)
    .await
    .map_err(db_error("Failed to record payment breakdown"))?;

    debug!(
        applied_to_expenses = %applied_to_expenses,
        applied_to_balance = %applied_to_balance,
        "Payment post-processed"
    );

    Ok(PostProcessOutcome {
        allocation,
        expense_settlements: plan.map(|p| p.settlements).unwrap_or_default(),
        applied_to_expenses,
        applied_to_balance,
        balance,
    })
}

/// Result of creating or transitioning a payment.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub allocations: Vec<PaymentAllocation>,
    pub guard: Option<GuardEvaluation>,
    pub outcome: Option<PostProcessOutcome>,
}

/// Lock the counterparty's user row. Must run before the payment insert:
/// the insert's foreign-key share lock on the same row would otherwise
/// block the later recompute of a concurrent payment.
async fn lock_counterparty(
    conn: &mut PgConnection,
    counterparty_id: Option<Uuid>,
) -> Result<(), SettlementError> {
    if let Some(user_id) = counterparty_id {
        directory::lock_user(&mut *conn, user_id).await?;
    }
    Ok(())
}

async fn run_guard(
    conn: &mut PgConnection,
    shop_id: Uuid,
    counterparty_id: Option<Uuid>,
    amount: Decimal,
    force_override: bool,
) -> Result<GuardEvaluation, SettlementError> {
    let farmer_id = counterparty_id
        .ok_or_else(|| SettlementError::invalid("counterparty_id", "a farmer is required"))?;
    let evaluation =
        guard::will_shop_to_farmer_worsen_debt(&mut *conn, shop_id, farmer_id, amount, force_override)
            .await?;
    if evaluation.decision == GuardDecision::Block {
        return Err(evaluation.into_rejection());
    }
    Ok(evaluation)
}

/// Validate, guard, persist and (when PAID) post-process a payment.
#[instrument(skip(conn, payment, settings), fields(direction = payment.direction().as_str(), amount = %payment.amount, status = %payment.status))]
pub async fn create_payment(
    conn: &mut PgConnection,
    payment: &NewPayment,
    settings: &SettlementSettings,
    actor_id: Option<Uuid>,
) -> Result<PaymentReceipt, SettlementError> {
    validate_payment(payment)?;
    let parties = resolve_parties(&mut *conn, payment).await?;
    lock_counterparty(&mut *conn, parties.counterparty_id).await?;

    let guard = if payment.direction() == PaymentDirection::ShopToFarmer {
        Some(
            run_guard(
                &mut *conn,
                parties.shop_id,
                parties.counterparty_id,
                money::round_money(payment.amount),
                payment.force_override,
            )
            .await?,
        )
    } else {
        None
    };

    let timer = DB_QUERY_DURATION
        .with_label_values(&["create_payment"])
        .start_timer();

    let created = insert_payment(&mut *conn, payment, parties, actor_id).await?;

    audit::record(
        &mut *conn,
        audit::AuditRecord {
            shop_id: Some(created.shop_id),
            actor_id,
            action: "payment_created",
            entity_type: "payment",
            entity_id: Some(created.payment_id),
            old_values: None,
            new_values: json!({
                "direction": payment.direction().as_str(),
                "amount": money::format_money(created.amount),
                "status": created.status,
                "transaction_id": created.transaction_id,
                "counterparty_id": created.counterparty_id,
                "force_override": created.force_override,
            }),
        },
    )
    .await?;

    let outcome = if created.is_paid() {
        Some(post_process(&mut *conn, &created, settings, actor_id).await?)
    } else {
        None
    };

    let stored = get_payment(&mut *conn, created.payment_id, false).await?;
    let allocations = list_allocations(&mut *conn, created.payment_id).await?;
    timer.observe_duration();

    info!(
        payment_id = %stored.payment_id,
        applied_to_expenses = ?stored.applied_to_expenses,
        applied_to_balance = ?stored.applied_to_balance,
        "Payment created"
    );

    Ok(PaymentReceipt {
        payment: stored,
        allocations,
        guard,
        outcome,
    })
}

/// Move a payment out of PENDING. PAID runs the guard and post-processing.
#[instrument(skip(conn, settings), fields(payment_id = %payment_id, status = %status))]
pub async fn update_payment_status(
    conn: &mut PgConnection,
    payment_id: Uuid,
    status: PaymentStatus,
    settings: &SettlementSettings,
    actor_id: Option<Uuid>,
) -> Result<PaymentReceipt, SettlementError> {
    let unlocked = get_payment(&mut *conn, payment_id, false).await?;
    lock_counterparty(&mut *conn, unlocked.counterparty_id).await?;
    let payment = get_payment(&mut *conn, payment_id, true).await?;
    let current = payment.parsed_status().ok_or_else(|| {
        SettlementError::Domain(anyhow::anyhow!(
            "Payment {} has unknown status '{}'",
            payment_id,
            payment.status
        ))
    })?;

    if current == status {
        let allocations = list_allocations(&mut *conn, payment_id).await?;
        return Ok(PaymentReceipt {
            payment,
            allocations,
            guard: None,
            outcome: None,
        });
    }
    if current.is_terminal() {
        return Err(SettlementError::invalid(
            "status",
            format!("payment is {} and cannot change to {}", current, status),
        ));
    }

    let guard = if status == PaymentStatus::Paid
        && payment.direction() == PaymentDirection::ShopToFarmer
    {
        Some(
            run_guard(
                &mut *conn,
                payment.shop_id,
                payment.counterparty_id,
                payment.amount,
                payment.force_override,
            )
            .await?,
        )
    } else {
        None
    };

    sqlx::query("UPDATE payments SET status = $1 WHERE payment_id = $2")
        .bind(status.as_str())
        .bind(payment_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to update payment status"))?;

    audit::record(
        &mut *conn,
        audit::AuditRecord {
            shop_id: Some(payment.shop_id),
            actor_id,
            action: "payment_status_changed",
            entity_type: "payment",
            entity_id: Some(payment_id),
            old_values: Some(json!({ "status": current.as_str() })),
            new_values: json!({ "status": status.as_str() }),
        },
    )
    .await?;

    let updated = get_payment(&mut *conn, payment_id, false).await?;
    let outcome = if status == PaymentStatus::Paid {
        Some(post_process(&mut *conn, &updated, settings, actor_id).await?)
    } else {
        None
    };

    let stored = get_payment(&mut *conn, payment_id, false).await?;
    let allocations = list_allocations(&mut *conn, payment_id).await?;

    info!(from = %current, to = %status, "Payment status changed");

    Ok(PaymentReceipt {
        payment: stored,
        allocations,
        guard,
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaymentMethod;
    use rust_decimal_macros::dec;

    fn payment(payer: PartyType, payee: PartyType, amount: Decimal) -> NewPayment {
        NewPayment {
            shop_id: Some(Uuid::new_v4()),
            transaction_id: None,
            counterparty_id: Some(Uuid::new_v4()),
            payer_type: payer,
            payee_type: payee,
            amount,
            method: PaymentMethod::Cash,
            status: PaymentStatus::Paid,
            notes: None,
            payment_date: None,
            force_override: false,
        }
    }

    #[test]
    fn shop_to_shop_is_rejected() {
        match validate_payment(&payment(PartyType::Shop, PartyType::Shop, dec!(10))) {
            Err(SettlementError::Validation(errors)) => assert_eq!(errors[0].field, "payee_type"),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn non_positive_amount_is_rejected() {
        assert!(validate_payment(&payment(PartyType::Buyer, PartyType::Shop, dec!(0))).is_err());
        assert!(validate_payment(&payment(PartyType::Buyer, PartyType::Shop, dec!(-5))).is_err());
        assert!(validate_payment(&payment(PartyType::Buyer, PartyType::Shop, dec!(0.01))).is_ok());
    }

    #[test]
    fn sub_cent_amount_is_rejected() {
        match validate_payment(&payment(PartyType::Farmer, PartyType::Shop, dec!(0.004))) {
            Err(SettlementError::Validation(errors)) => assert_eq!(errors[0].field, "amount"),
            other => panic!("expected validation error, got {:?}", other),
        }
        assert!(validate_payment(&payment(PartyType::Farmer, PartyType::Shop, dec!(0.005))).is_ok());
    }

    #[test]
    fn shop_or_transaction_is_required() {
        let mut orphan = payment(PartyType::Farmer, PartyType::Shop, dec!(10));
        orphan.shop_id = None;
        assert!(validate_payment(&orphan).is_err());

        orphan.transaction_id = Some(Uuid::new_v4());
        assert!(validate_payment(&orphan).is_ok());
    }

    #[test]
    fn counterparty_role_follows_direction() {
        assert_eq!(counterparty_role(PaymentDirection::BuyerToShop), Some(UserRole::Buyer));
        assert_eq!(counterparty_role(PaymentDirection::ShopToBuyer), Some(UserRole::Buyer));
        assert_eq!(counterparty_role(PaymentDirection::ShopToFarmer), Some(UserRole::Farmer));
        assert_eq!(counterparty_role(PaymentDirection::FarmerToShop), Some(UserRole::Farmer));
        assert_eq!(counterparty_role(PaymentDirection::Other), None);
    }
}
