//! Domain models for settlement-service.

mod expense;
mod ledger;
mod party;
mod payment;
mod transaction;
mod user;

pub use expense::{CreateExpense, Expense, ExpenseSettlement, ExpenseStatus, ExpenseType};
pub use ledger::{AuditLog, BalanceSnapshot, LedgerEntry, NewLedgerEntry};
pub use party::{PartyType, PaymentDirection, PaymentMethod, PaymentStatus};
pub use payment::{NewPayment, Payment, PaymentAllocation};
pub use transaction::{CreateTransaction, Transaction, TransactionPaymentStatus};
pub use user::{CreateShop, CreateUser, Shop, User, UserRole};
