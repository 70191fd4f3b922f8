//! Recording sales and tracking their buyer-side settlement status.

use crate::error::{FieldError, SettlementError};
use crate::models::{CreateTransaction, Transaction, TransactionPaymentStatus, UserRole};
use crate::money;
use crate::services::allocation::{self, ObligationSide};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::{db_error, directory};
use rust_decimal::Decimal;
use sqlx::PgConnection;
use tracing::{info, instrument};
use uuid::Uuid;

const TRANSACTION_COLUMNS: &str = "transaction_id, shop_id, farmer_id, buyer_id, total_amount, \
     commission_amount, farmer_earning, payment_status, description, transaction_date, created_utc";

/// Amounts must be non-negative and split exactly into commission and earning.
pub fn validate_amounts(
    total: Decimal,
    commission: Decimal,
    farmer_earning: Decimal,
) -> Result<(), SettlementError> {
    let mut errors = Vec::new();
    if total <= Decimal::ZERO {
        errors.push(FieldError::new("total_amount", "must be greater than zero"));
    }
    if commission < Decimal::ZERO {
        errors.push(FieldError::new("commission_amount", "must not be negative"));
    }
    if farmer_earning < Decimal::ZERO {
        errors.push(FieldError::new("farmer_earning", "must not be negative"));
    }
    if (commission + farmer_earning - total).abs() > money::TOLERANCE {
        errors.push(FieldError::new(
            "total_amount",
            format!(
                "commission ({}) plus farmer earning ({}) must equal total ({})",
                commission, farmer_earning, total
            ),
        ));
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(SettlementError::Validation(errors))
    }
}

/// Status implied by how much of `total` has been paid.
pub fn settlement_status(paid: Decimal, total: Decimal) -> TransactionPaymentStatus {
    if paid <= Decimal::ZERO {
        TransactionPaymentStatus::Pending
    } else if paid + money::TOLERANCE >= total {
        TransactionPaymentStatus::Paid
    } else {
        TransactionPaymentStatus::Partial
    }
}

#[instrument(skip(conn, input), fields(shop_id = %input.shop_id, farmer_id = %input.farmer_id, buyer_id = %input.buyer_id))]
pub async fn create_transaction(
    conn: &mut PgConnection,
    input: &CreateTransaction,
) -> Result<Transaction, SettlementError> {
    validate_amounts(
        input.total_amount,
        input.commission_amount,
        input.farmer_earning,
    )?;
    directory::get_shop(&mut *conn, input.shop_id).await?;
    directory::expect_member(&mut *conn, input.shop_id, input.farmer_id, UserRole::Farmer, "farmer_id").await?;
    directory::expect_member(&mut *conn, input.shop_id, input.buyer_id, UserRole::Buyer, "buyer_id").await?;
    // Party rows are locked before the insert takes its foreign-key share locks.
    directory::lock_user(&mut *conn, input.farmer_id).await?;
    directory::lock_user(&mut *conn, input.buyer_id).await?;

    let timer = DB_QUERY_DURATION
        .with_label_values(&["create_transaction"])
        .start_timer();

    let sql = format!(
        r#"
        INSERT INTO transactions
            (transaction_id, shop_id, farmer_id, buyer_id, total_amount, commission_amount,
             farmer_earning, description, transaction_date)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, COALESCE($9, clock_timestamp()))
        RETURNING {}
        "#,
        TRANSACTION_COLUMNS
    );
    let transaction = sqlx::query_as::<_, Transaction>(&sql)
        .bind(Uuid::new_v4())
        .bind(input.shop_id)
        .bind(input.farmer_id)
        .bind(input.buyer_id)
        .bind(money::round_money(input.total_amount))
        .bind(money::round_money(input.commission_amount))
        .bind(money::round_money(input.farmer_earning))
        .bind(&input.description)
        .bind(input.transaction_date)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error("Failed to create transaction"))?;

    timer.observe_duration();
    info!(
        transaction_id = %transaction.transaction_id,
        total = %transaction.total_amount,
        commission = %transaction.commission_amount,
        "Transaction created"
    );

    Ok(transaction)
}

pub async fn get_transaction(
    conn: &mut PgConnection,
    transaction_id: Uuid,
) -> Result<Transaction, SettlementError> {
    let sql = format!(
        "SELECT {} FROM transactions WHERE transaction_id = $1",
        TRANSACTION_COLUMNS
    );
    sqlx::query_as::<_, Transaction>(&sql)
        .bind(transaction_id)
        .fetch_optional(conn)
        .await
        .map_err(db_error("Failed to get transaction"))?
        .ok_or_else(|| SettlementError::not_found("transaction", transaction_id))
}

/// Re-derive `payment_status` from PAID buyer allocations and store it.
#[instrument(skip(conn), fields(transaction_id = %transaction_id))]
pub async fn refresh_payment_status(
    conn: &mut PgConnection,
    transaction_id: Uuid,
) -> Result<TransactionPaymentStatus, SettlementError> {
    let obligation =
        allocation::load_transaction_obligation(&mut *conn, ObligationSide::Buyer, transaction_id, false)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SettlementError::not_found("transaction", transaction_id))?;

    let status = settlement_status(obligation.allocated, obligation.obligation);

    sqlx::query(
        "UPDATE transactions SET payment_status = $1 WHERE transaction_id = $2 AND payment_status <> $1",
    )
    .bind(status.as_str())
    .bind(transaction_id)
    .execute(conn)
    .await
    .map_err(db_error("Failed to update transaction payment status"))?;

    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn split_must_add_up() {
        assert!(validate_amounts(dec!(1000), dec!(50), dec!(950)).is_ok());
        assert!(validate_amounts(dec!(1000), dec!(50), dec!(949.995)).is_ok());

        match validate_amounts(dec!(1000), dec!(50), dec!(900)) {
            Err(SettlementError::Validation(errors)) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].field, "total_amount");
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_non_positive_total_and_negative_parts() {
        match validate_amounts(dec!(0), dec!(-1), dec!(1)) {
            Err(SettlementError::Validation(errors)) => {
                let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
                assert!(fields.contains(&"total_amount"));
                assert!(fields.contains(&"commission_amount"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn status_follows_paid_amount() {
        assert_eq!(settlement_status(dec!(0), dec!(1000)), TransactionPaymentStatus::Pending);
        assert_eq!(settlement_status(dec!(300), dec!(1000)), TransactionPaymentStatus::Partial);
        assert_eq!(settlement_status(dec!(999.99), dec!(1000)), TransactionPaymentStatus::Paid);
        assert_eq!(settlement_status(dec!(999.98), dec!(1000)), TransactionPaymentStatus::Partial);
        assert_eq!(settlement_status(dec!(1000), dec!(1000)), TransactionPaymentStatus::Paid);
    }
}
