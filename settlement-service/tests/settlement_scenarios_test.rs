//! End-to-end settlement scenarios against Postgres.

mod common;

use common::spawn_shop;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use settlement_service::models::{ExpenseStatus, PartyType};
use settlement_service::SettlementError;

#[tokio::test]
async fn repayment_settles_oldest_expense_first() {
    let Some(t) = spawn_shop().await else { return };

    let older = t.expense(dec!(10)).await;
    let newer = t.expense(dec!(5)).await;
    assert_eq!(t.balance_of(t.farmer.user_id).await, dec!(-15));

    let plan = t
        .service
        .apply_repayment_fifo(t.shop.shop_id, t.farmer.user_id, dec!(12), None, false)
        .await
        .unwrap();

    assert_eq!(plan.remaining, dec!(0));
    assert_eq!(plan.settlements.len(), 2);
    assert_eq!(plan.settlements[0].expense_id, older);
    assert_eq!(plan.settlements[0].amount, dec!(10));
    assert!(plan.settlements[0].fully_settled);
    assert_eq!(plan.settlements[1].expense_id, newer);
    assert_eq!(plan.settlements[1].amount, dec!(2));
    assert!(!plan.settlements[1].fully_settled);

    let older = t.service.get_expense(older).await.unwrap();
    assert_eq!(older.expense.status, ExpenseStatus::Settled.as_str());
    let newer = t.service.get_expense(newer).await.unwrap();
    assert_eq!(newer.expense.status, ExpenseStatus::Pending.as_str());
    assert_eq!(newer.settlements.len(), 1);

    assert_eq!(t.balance_of(t.farmer.user_id).await, dec!(-3));
}

#[tokio::test]
async fn buyer_payments_realize_commission_proportionally() {
    let Some(t) = spawn_shop().await else { return };
    let sale = t.sale(dec!(1000), dec!(50)).await;
    assert_eq!(t.balance_of(t.buyer.user_id).await, dec!(1000));

    let mut first = t.payment(PartyType::Buyer, PartyType::Shop, dec!(300));
    first.transaction_id = Some(sale.transaction_id);
    let receipt = t.service.create_payment(&first, None).await.unwrap();
    assert_eq!(receipt.allocations.len(), 1);
    assert_eq!(
        receipt.outcome.as_ref().unwrap().allocation.commission_realized,
        dec!(15)
    );

    let owner = t.service.get_user(t.owner.user_id).await.unwrap();
    assert_eq!(owner.cumulative_value, dec!(15));
    let partial = t.service.get_transaction(sale.transaction_id).await.unwrap();
    assert_eq!(partial.payment_status, "partial");

    let mut second = t.payment(PartyType::Buyer, PartyType::Shop, dec!(700));
    second.transaction_id = Some(sale.transaction_id);
    t.service.create_payment(&second, None).await.unwrap();

    let owner = t.service.get_user(t.owner.user_id).await.unwrap();
    assert_eq!(owner.cumulative_value, dec!(50));
    let paid = t.service.get_transaction(sale.transaction_id).await.unwrap();
    assert_eq!(paid.payment_status, "paid");
    assert_eq!(t.balance_of(t.buyer.user_id).await, dec!(0));
}

#[tokio::test]
async fn guard_blocks_indebted_farmer_unless_forced() {
    let Some(t) = spawn_shop().await else { return };
    t.expense(dec!(100)).await;
    assert_eq!(t.balance_of(t.farmer.user_id).await, dec!(-100));

    let payment = t.payment(PartyType::Shop, PartyType::Farmer, dec!(50));
    let err = t.service.create_payment(&payment, None).await.unwrap_err();
    match err {
        SettlementError::DebtGuardRejection {
            current_balance, ..
        } => assert_eq!(current_balance, dec!(-100)),
        other => panic!("expected guard rejection, got {:?}", other),
    }

    let mut forced = payment.clone();
    forced.force_override = true;
    let receipt = t.service.create_payment(&forced, None).await.unwrap();
    let guard = receipt.guard.expect("guard evaluation recorded");
    assert!(!guard.worsen);
    assert!(guard.overridden);
    assert_eq!(receipt.payment.status, "PAID");
    assert_eq!(receipt.payment.applied_to_expenses, Some(dec!(50)));
    assert_eq!(t.balance_of(t.farmer.user_id).await, dec!(-50));
}

#[tokio::test]
async fn expense_is_absorbed_by_recent_payment_until_settled() {
    let Some(t) = spawn_shop().await else { return };
    let sale = t.sale(dec!(1400), dec!(100)).await;

    let mut advance = t.payment(PartyType::Shop, PartyType::Farmer, dec!(300));
    advance.transaction_id = Some(sale.transaction_id);
    t.service.create_payment(&advance, None).await.unwrap();
    assert_eq!(t.balance_of(t.farmer.user_id).await, dec!(1000));

    let recorded = t
        .service
        .create_expense(
            &settlement_service::models::CreateExpense {
                shop_id: t.shop.shop_id,
                user_id: t.farmer.user_id,
                amount: dec!(300),
                expense_type: settlement_service::models::ExpenseType::Expense,
                description: None,
                transaction_id: None,
            },
            None,
        )
        .await
        .unwrap();
    let clawback = recorded.clawback.expect("farmer expenses claw back");
    assert_eq!(clawback.absorbed, dec!(300));
    assert_eq!(recorded.balance.new_balance, dec!(1000));
    assert_eq!(t.balance_of(t.farmer.user_id).await, dec!(1000));

    let settled = t
        .service
        .settle_expense_amount(recorded.expense.expense_id, dec!(300), Some("cash".to_string()))
        .await
        .unwrap();
    assert_eq!(settled.expense.status, ExpenseStatus::Settled.as_str());
    assert_eq!(settled.balance.delta(), dec!(300));
    assert_eq!(t.balance_of(t.farmer.user_id).await, dec!(1300));
}

#[tokio::test]
async fn clawback_keeps_settlements_made_by_the_adjusted_payment() {
    let Some(t) = spawn_shop().await else { return };
    t.sale(dec!(1400), dec!(100)).await;
    let transport = t.expense(dec!(30)).await;

    let advance = t.payment(PartyType::Shop, PartyType::Farmer, dec!(300));
    let receipt = t.service.create_payment(&advance, None).await.unwrap();
    assert_eq!(receipt.payment.applied_to_expenses, Some(dec!(30)));
    let payment_id = receipt.payment.payment_id;

    let recorded = t
        .service
        .create_expense(
            &settlement_service::models::CreateExpense {
                shop_id: t.shop.shop_id,
                user_id: t.farmer.user_id,
                amount: dec!(100),
                expense_type: settlement_service::models::ExpenseType::Expense,
                description: None,
                transaction_id: None,
            },
            None,
        )
        .await
        .unwrap();
    let clawback = recorded.clawback.expect("farmer expenses claw back");
    assert_eq!(clawback.absorbed, dec!(100));
    assert_eq!(clawback.adjustments[0].payment_id, payment_id);

    let details = t.service.get_expense(transport).await.unwrap();
    let settled: Decimal = details.settlements.iter().map(|s| s.amount).sum();
    assert_eq!(settled, dec!(30));
    assert_eq!(details.expense.status, ExpenseStatus::Settled.as_str());

    let kept: Option<String> = sqlx::query_scalar(
        r#"
        SELECT new_values->>'expense_settlements_kept' FROM audit_logs
        WHERE action = 'payment_adjusted_for_expense' AND entity_id = $1
        "#,
    )
    .bind(payment_id)
    .fetch_one(t.db.pool())
    .await
    .unwrap();
    assert_eq!(kept.as_deref(), Some("30.00"));
}

#[tokio::test]
async fn farmer_repayment_splits_between_expenses_and_balance() {
    let Some(t) = spawn_shop().await else { return };
    t.expense(dec!(30)).await;

    let payment = t.payment(PartyType::Farmer, PartyType::Shop, dec!(50));
    let receipt = t.service.create_payment(&payment, None).await.unwrap();

    assert_eq!(receipt.payment.applied_to_expenses, Some(dec!(30)));
    assert_eq!(receipt.payment.applied_to_balance, Some(dec!(20)));
    assert_eq!(receipt.payment.balance_before, Some(dec!(-30)));
    assert_eq!(receipt.payment.balance_after, Some(dec!(0)));
    assert!(receipt.allocations.is_empty());
}
