//! HTTP handlers for settlement-service.
//!
//! Handlers normalise input and map results; all settlement rules live in
//! [`crate::services`].

pub mod balances;
pub mod extract;
pub mod health;
pub mod participants;
pub mod payments;

pub use balances::*;
pub use extract::{ActorId, ValidatedJson};
pub use health::*;
pub use participants::*;
pub use payments::*;
