//! Settlement Service - marketplace settlement and balance consistency.
//!
//! Maintains farmer and buyer balances for a shop, applies repayments to
//! expenses oldest first, allocates payments across transactions, realizes
//! owner commission as buyers pay, guards shop-to-farmer payments against
//! deepening farmer debt, and reconciles cached balances with the ledger.

pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod models;
pub mod money;
pub mod services;
pub mod startup;

pub use error::SettlementError;
