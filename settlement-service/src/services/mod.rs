//! Services module for settlement-service.
//!
//! Every function below the [`SettlementService`] facade takes a
//! `&mut PgConnection` and runs inside the caller's transaction. Only the
//! facade begins and commits.

pub mod allocation;
pub mod audit;
pub mod balance;
pub mod commission;
pub mod database;
pub mod directory;
pub mod expenses;
pub mod fifo;
pub mod guard;
pub mod ledger;
pub mod metrics;
pub mod payments;
pub mod reconciliation;
pub mod settlement;
pub mod transactions;

use crate::error::SettlementError;

pub use database::Database;
pub use metrics::{get_metrics, init_metrics, record_error};
pub use settlement::SettlementService;

/// Wrap a store error with the operation that failed.
pub(crate) fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> SettlementError {
    move |e| SettlementError::Domain(anyhow::Error::new(e).context(context))
}
