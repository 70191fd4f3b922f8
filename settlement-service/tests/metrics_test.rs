//! Prometheus counters driven by the settlement chain.
//!
//! Kept in its own test binary: the counters are process-global.

mod common;

use common::spawn_shop;
use rust_decimal_macros::dec;
use settlement_service::models::PartyType;
use settlement_service::services::metrics::COMMISSION_REALIZED;

#[tokio::test]
async fn commission_counter_matches_realized_commission() {
    let Some(t) = spawn_shop().await else { return };
    let sale = t.sale(dec!(1000), dec!(50)).await;

    let before = COMMISSION_REALIZED.get();
    let mut payment = t.payment(PartyType::Buyer, PartyType::Shop, dec!(300));
    payment.transaction_id = Some(sale.transaction_id);
    let receipt = t.service.create_payment(&payment, None).await.unwrap();

    let outcome = receipt.outcome.expect("paid payments are post-processed");
    assert_eq!(outcome.allocation.commission_realized, dec!(15));
    assert!((COMMISSION_REALIZED.get() - before - 15.0).abs() < 1e-9);
}
