//! Incremental recognition of the shop owner's commission.

use crate::error::SettlementError;
use crate::money;
use crate::services::metrics::{record_commission, DB_QUERY_DURATION};
use crate::services::{audit, db_error};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::PgConnection;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Commission earned by allocating `allocated` of a sale worth `total`
/// carrying `commission`: `round(allocated * commission / total, 2)`.
pub fn commission_share(allocated: Decimal, commission: Decimal, total: Decimal) -> Decimal {
    if allocated <= Decimal::ZERO || commission <= Decimal::ZERO || total <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    money::round_money(allocated * commission / total)
}

#[derive(Debug, sqlx::FromRow)]
struct CommissionBasis {
    shop_id: Uuid,
    owner_id: Option<Uuid>,
    commission_amount: Decimal,
    total_amount: Decimal,
}

/// Credit the owner's `cumulative_value` with the share of a buyer allocation.
///
/// The increment is a single atomic `UPDATE`, never read-modify-write.
#[instrument(skip(conn), fields(transaction_id = %transaction_id, payment_id = %payment_id, allocated = %allocated))]
pub async fn realize_commission(
    conn: &mut PgConnection,
    transaction_id: Uuid,
    payment_id: Uuid,
    allocated: Decimal,
    actor_id: Option<Uuid>,
) -> Result<Decimal, SettlementError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["realize_commission"])
        .start_timer();

    let basis = sqlx::query_as::<_, CommissionBasis>(
        r#"
        SELECT t.shop_id, s.owner_id, t.commission_amount, t.total_amount
        FROM transactions t
        JOIN shops s ON s.shop_id = t.shop_id
        WHERE t.transaction_id = $1
        "#,
    )
    .bind(transaction_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("Failed to load commission basis"))?
    .ok_or_else(|| SettlementError::not_found("transaction", transaction_id))?;

    let share = commission_share(allocated, basis.commission_amount, basis.total_amount);
    if share <= Decimal::ZERO {
        timer.observe_duration();
        return Ok(Decimal::ZERO);
    }

    let owner_id = match basis.owner_id {
        Some(owner_id) => owner_id,
        None => {
            warn!(shop_id = %basis.shop_id, "Shop has no owner; commission not realized");
            timer.observe_duration();
            return Ok(Decimal::ZERO);
        }
    };

    sqlx::query("UPDATE users SET cumulative_value = cumulative_value + $1 WHERE user_id = $2")
        .bind(share)
        .bind(owner_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to increment owner commission"))?;

    audit::record(
        &mut *conn,
        audit::AuditRecord {
            shop_id: Some(basis.shop_id),
            actor_id,
            action: "commission_realized",
            entity_type: "transaction",
            entity_id: Some(transaction_id),
            old_values: None,
            new_values: json!({
                "payment_id": payment_id,
                "owner_id": owner_id,
                "allocated_amount": money::format_money(allocated),
                "commission_realized": money::format_money(share),
            }),
        },
    )
    .await?;

    timer.observe_duration();
    record_commission(share.to_f64().unwrap_or_default());
    info!(owner_id = %owner_id, commission = %share, "Commission realized");

    Ok(share)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn proportional_to_allocation() {
        assert_eq!(commission_share(dec!(300), dec!(50), dec!(1000)), dec!(15));
        assert_eq!(commission_share(dec!(700), dec!(50), dec!(1000)), dec!(35));
    }

    #[test]
    fn rounds_to_cents() {
        // 100 * 7 / 30 = 23.333...
        assert_eq!(commission_share(dec!(100), dec!(7), dec!(30)), dec!(23.33));
        // 1 * 5 / 200 = 0.025 rounds away from zero
        assert_eq!(commission_share(dec!(1), dec!(5), dec!(200)), dec!(0.03));
    }

    #[test]
    fn degenerate_inputs_realize_nothing() {
        assert_eq!(commission_share(dec!(100), dec!(0), dec!(1000)), dec!(0));
        assert_eq!(commission_share(dec!(100), dec!(50), dec!(0)), dec!(0));
        assert_eq!(commission_share(dec!(0), dec!(50), dec!(1000)), dec!(0));
    }

    proptest! {
        #[test]
        fn prop_full_payment_in_parts_stays_within_a_cent_per_part(
            total_cents in 100i64..1_000_000i64,
            commission_pct in 1u32..50u32,
            split_pct in 1u32..99u32,
        ) {
            let total = Decimal::new(total_cents, 2);
            let commission = money::round_money(total * Decimal::from(commission_pct) / Decimal::ONE_HUNDRED);
            let first = money::round_money(total * Decimal::from(split_pct) / Decimal::ONE_HUNDRED);
            let second = total - first;

            let whole = commission_share(total, commission, total);
            let parts = commission_share(first, commission, total) + commission_share(second, commission, total);

            prop_assert_eq!(whole, commission);
            prop_assert!((parts - whole).abs() <= dec!(0.01));
        }
    }
}
