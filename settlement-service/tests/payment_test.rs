//! Payment intake, allocation and status transitions.

mod common;

use common::{spawn_shop, spawn_shop_with};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use settlement_service::config::SettlementSettings;
use settlement_service::models::{PartyType, PaymentStatus};
use settlement_service::services::allocation;
use settlement_service::SettlementError;

#[tokio::test]
async fn allocation_never_runs_twice_for_a_payment() {
    let Some(t) = spawn_shop().await else { return };
    let sale = t.sale(dec!(1000), dec!(50)).await;

    let mut payment = t.payment(PartyType::Buyer, PartyType::Shop, dec!(300));
    payment.transaction_id = Some(sale.transaction_id);
    let receipt = t.service.create_payment(&payment, None).await.unwrap();

    let mut conn = t.db.pool().acquire().await.unwrap();
    let again = allocation::allocate_payment_to_transactions(
        &mut *conn,
        &receipt.payment,
        t.service.settings(),
        None,
    )
    .await
    .unwrap();
    assert!(again.already_allocated);
    assert!(again.allocations.is_empty());
    assert_eq!(again.commission_realized, dec!(0));

    let owner = t.service.get_user(t.owner.user_id).await.unwrap();
    assert_eq!(owner.cumulative_value, dec!(15));
    let stored = t.service.get_payment(receipt.payment.payment_id).await.unwrap();
    assert_eq!(stored.allocations.len(), 1);
    assert_eq!(stored.allocations[0].allocated_amount, dec!(300));
}

#[tokio::test]
async fn linked_allocation_is_capped_by_outstanding_amount() {
    let Some(t) = spawn_shop().await else { return };
    let sale = t.sale(dec!(100), dec!(10)).await;

    let mut payment = t.payment(PartyType::Buyer, PartyType::Shop, dec!(150));
    payment.transaction_id = Some(sale.transaction_id);
    let receipt = t.service.create_payment(&payment, None).await.unwrap();

    let outcome = receipt.outcome.expect("paid payments are post-processed");
    assert_eq!(outcome.allocation.allocated(), dec!(100));
    assert_eq!(outcome.allocation.unallocated, dec!(50));
    assert_eq!(outcome.allocation.commission_realized, dec!(10));
}

#[tokio::test]
async fn pending_payment_settles_only_when_paid() {
    let Some(t) = spawn_shop().await else { return };
    let sale = t.sale(dec!(1000), dec!(50)).await;

    let mut payment = t.payment(PartyType::Buyer, PartyType::Shop, dec!(400));
    payment.transaction_id = Some(sale.transaction_id);
    payment.status = PaymentStatus::Pending;
    let pending = t.service.create_payment(&payment, None).await.unwrap();
    assert!(pending.outcome.is_none());
    assert!(pending.allocations.is_empty());
    assert_eq!(t.balance_of(t.buyer.user_id).await, dec!(1000));

    let payment_id = pending.payment.payment_id;
    let paid = t
        .service
        .update_payment_status(payment_id, PaymentStatus::Paid, None)
        .await
        .unwrap();
    assert_eq!(paid.payment.status, "PAID");
    assert_eq!(paid.allocations.len(), 1);
    assert_eq!(t.balance_of(t.buyer.user_id).await, dec!(600));

    let repeated = t
        .service
        .update_payment_status(payment_id, PaymentStatus::Paid, None)
        .await
        .unwrap();
    assert!(repeated.outcome.is_none());
    assert_eq!(t.balance_of(t.buyer.user_id).await, dec!(600));

    let err = t
        .service
        .update_payment_status(payment_id, PaymentStatus::Cancelled, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::Validation(_)));
}

#[tokio::test]
async fn standalone_buyer_payment_stays_a_bookkeeping_credit() {
    let Some(t) = spawn_shop().await else { return };
    t.sale(dec!(1000), dec!(50)).await;

    let payment = t.payment(PartyType::Buyer, PartyType::Shop, dec!(200));
    let receipt = t.service.create_payment(&payment, None).await.unwrap();
    assert!(receipt.allocations.is_empty());
    assert_eq!(t.balance_of(t.buyer.user_id).await, dec!(800));

    let breakdown = t.service.balance_breakdown(t.buyer.user_id).await.unwrap();
    assert_eq!(breakdown.bookkeeping_credits, dec!(200));
    assert_eq!(breakdown.derived_balance, dec!(800));

    let owner = t.service.get_user(t.owner.user_id).await.unwrap();
    assert_eq!(owner.cumulative_value, dec!(0));

    let audit = t.service.audit_shop_balances(t.shop.shop_id).await.unwrap();
    assert_eq!(audit.summary.bookkeeping_credits, 1);
    assert_eq!(audit.summary.payment_issues, 0);
}

#[tokio::test]
async fn standalone_buyer_payment_allocates_oldest_first_when_enabled() {
    let settings = SettlementSettings {
        allocate_standalone_buyer_payments: true,
        ..SettlementSettings::default()
    };
    let Some(t) = spawn_shop_with(settings).await else { return };
    let first = t.sale(dec!(100), dec!(10)).await;
    let second = t.sale(dec!(200), dec!(20)).await;

    let payment = t.payment(PartyType::Buyer, PartyType::Shop, dec!(150));
    let receipt = t.service.create_payment(&payment, None).await.unwrap();

    let outcome = receipt.outcome.unwrap();
    assert_eq!(outcome.allocation.allocations.len(), 2);
    assert_eq!(outcome.allocation.allocations[0].transaction_id, first.transaction_id);
    assert_eq!(outcome.allocation.allocations[0].amount, dec!(100));
    assert_eq!(outcome.allocation.allocations[1].transaction_id, second.transaction_id);
    assert_eq!(outcome.allocation.allocations[1].amount, dec!(50));
    assert_eq!(outcome.allocation.commission_realized, dec!(15));
    assert_eq!(t.balance_of(t.buyer.user_id).await, dec!(150));
}

#[tokio::test]
async fn refund_to_buyer_lowers_buyer_balance() {
    let Some(t) = spawn_shop().await else { return };
    let refund = t.payment(PartyType::Shop, PartyType::Buyer, dec!(40));
    t.service.create_payment(&refund, None).await.unwrap();
    assert_eq!(t.balance_of(t.buyer.user_id).await, dec!(-40));
}

#[tokio::test]
async fn malformed_payments_are_rejected_before_persisting() {
    let Some(t) = spawn_shop().await else { return };
    let sale = t.sale(dec!(500), dec!(25)).await;

    let shop_to_shop = t.payment(PartyType::Shop, PartyType::Shop, dec!(10));
    let err = t.service.create_payment(&shop_to_shop, None).await.unwrap_err();
    assert!(matches!(err, SettlementError::Validation(_)));

    let zero = t.payment(PartyType::Buyer, PartyType::Shop, dec!(0));
    let err = t.service.create_payment(&zero, None).await.unwrap_err();
    assert!(matches!(err, SettlementError::Validation(_)));

    let sub_cent = t.payment(PartyType::Farmer, PartyType::Shop, dec!(0.004));
    let err = t.service.create_payment(&sub_cent, None).await.unwrap_err();
    assert!(matches!(err, SettlementError::Validation(_)));

    let mut wrong_party = t.payment(PartyType::Buyer, PartyType::Shop, dec!(10));
    wrong_party.transaction_id = Some(sale.transaction_id);
    wrong_party.counterparty_id = Some(t.farmer.user_id);
    let err = t.service.create_payment(&wrong_party, None).await.unwrap_err();
    assert!(matches!(err, SettlementError::Validation(_)));

    assert_eq!(t.balance_of(t.buyer.user_id).await, dec!(500));
}

#[tokio::test]
async fn concurrent_buyer_payments_both_commit() {
    let Some(t) = spawn_shop().await else { return };
    let first_sale = t.sale(dec!(500), dec!(25)).await;
    let second_sale = t.sale(dec!(400), dec!(20)).await;

    let mut first = t.payment(PartyType::Buyer, PartyType::Shop, dec!(300));
    first.transaction_id = Some(first_sale.transaction_id);
    let mut second = t.payment(PartyType::Buyer, PartyType::Shop, dec!(200));
    second.transaction_id = Some(second_sale.transaction_id);

    let (a, b) = tokio::join!(
        t.service.create_payment(&first, None),
        t.service.create_payment(&second, None)
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(t.balance_of(t.buyer.user_id).await, dec!(400));
    let check = t.service.reconcile_user_balance(t.buyer.user_id).await.unwrap();
    assert!(check.is_reconciled);
}

#[tokio::test]
async fn concurrent_farmer_repayments_never_oversettle_an_expense() {
    let Some(t) = spawn_shop().await else { return };
    let expense_id = t.expense(dec!(100)).await;

    let first = t.payment(PartyType::Farmer, PartyType::Shop, dec!(60));
    let second = t.payment(PartyType::Farmer, PartyType::Shop, dec!(60));
    let (a, b) = tokio::join!(
        t.service.create_payment(&first, None),
        t.service.create_payment(&second, None)
    );
    let applied = a.unwrap().payment.applied_to_expenses.unwrap_or_default()
        + b.unwrap().payment.applied_to_expenses.unwrap_or_default();
    assert_eq!(applied, dec!(100));

    let details = t.service.get_expense(expense_id).await.unwrap();
    let settled: Decimal = details.settlements.iter().map(|s| s.amount).sum();
    assert!(settled <= details.expense.amount);
    assert_eq!(settled, dec!(100));

    let check = t.service.reconcile_user_balance(t.farmer.user_id).await.unwrap();
    assert!(check.is_reconciled);
}

#[tokio::test]
async fn concurrent_shop_payments_cannot_both_pass_the_debt_guard() {
    let Some(t) = spawn_shop().await else { return };
    t.sale(dec!(110), dec!(10)).await;
    assert_eq!(t.balance_of(t.farmer.user_id).await, dec!(100));

    let first = t.payment(PartyType::Shop, PartyType::Farmer, dec!(100));
    let second = t.payment(PartyType::Shop, PartyType::Farmer, dec!(100));
    let (a, b) = tokio::join!(
        t.service.create_payment(&first, None),
        t.service.create_payment(&second, None)
    );

    let results = [a, b];
    let committed = results.iter().filter(|r| r.is_ok()).count();
    let blocked = results
        .iter()
        .filter(|r| matches!(r, Err(SettlementError::DebtGuardRejection { .. })))
        .count();
    assert_eq!(committed, 1);
    assert_eq!(blocked, 1);
    assert_eq!(t.balance_of(t.farmer.user_id).await, dec!(0));
}
