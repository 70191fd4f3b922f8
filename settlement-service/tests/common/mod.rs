//! Common test utilities for settlement-service integration tests.

#![allow(dead_code)]

use rust_decimal::Decimal;
use settlement_service::config::SettlementSettings;
use settlement_service::models::{
    CreateExpense, CreateShop, CreateTransaction, CreateUser, ExpenseType, NewPayment, PartyType,
    PaymentMethod, PaymentStatus, Shop, Transaction, User, UserRole,
};
use settlement_service::services::{Database, SettlementService};
use std::sync::{Arc, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,settlement_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// A fresh shop with one farmer and one buyer.
pub struct TestShop {
    pub service: SettlementService,
    pub db: Arc<Database>,
    pub shop: Shop,
    pub owner: User,
    pub farmer: User,
    pub buyer: User,
}

/// Connect to `TEST_DATABASE_URL`, run migrations and seed a new shop.
/// Returns `None` when the variable is unset so the suite can run without Postgres.
pub async fn spawn_shop() -> Option<TestShop> {
    spawn_shop_with(SettlementSettings::default()).await
}

pub async fn spawn_shop_with(settings: SettlementSettings) -> Option<TestShop> {
    init_tracing();

    let database_url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("TEST_DATABASE_URL not set; skipping database test");
            return None;
        }
    };

    let db = Database::new(&database_url, 4, 1)
        .await
        .expect("Failed to connect to test database");
    db.run_migrations()
        .await
        .expect("Failed to run migrations");
    let db = Arc::new(db);
    let service = SettlementService::new(db.clone(), settings);

    let suffix = Uuid::new_v4().simple().to_string();
    let (shop, owner) = service
        .create_shop(&CreateShop {
            name: format!("Mandi {}", &suffix[..8]),
            owner_username: format!("owner-{}", suffix),
        })
        .await
        .expect("Failed to create shop");
    let farmer = service
        .create_user(&CreateUser {
            shop_id: shop.shop_id,
            username: format!("farmer-{}", suffix),
            role: UserRole::Farmer,
        })
        .await
        .expect("Failed to create farmer");
    let buyer = service
        .create_user(&CreateUser {
            shop_id: shop.shop_id,
            username: format!("buyer-{}", suffix),
            role: UserRole::Buyer,
        })
        .await
        .expect("Failed to create buyer");

    Some(TestShop {
        service,
        db,
        shop,
        owner,
        farmer,
        buyer,
    })
}

impl TestShop {
    pub async fn sale(&self, total: Decimal, commission: Decimal) -> Transaction {
        self.service
            .create_transaction(&CreateTransaction {
                shop_id: self.shop.shop_id,
                farmer_id: self.farmer.user_id,
                buyer_id: self.buyer.user_id,
                total_amount: total,
                commission_amount: commission,
                farmer_earning: total - commission,
                description: Some("Tomatoes".to_string()),
                transaction_date: None,
            })
            .await
            .expect("Failed to create transaction")
            .transaction
    }

    pub async fn expense(&self, amount: Decimal) -> Uuid {
        self.service
            .create_expense(
                &CreateExpense {
                    shop_id: self.shop.shop_id,
                    user_id: self.farmer.user_id,
                    amount,
                    expense_type: ExpenseType::Expense,
                    description: Some("Transport".to_string()),
                    transaction_id: None,
                },
                None,
            )
            .await
            .expect("Failed to create expense")
            .expense
            .expense_id
    }

    pub fn payment(&self, payer: PartyType, payee: PartyType, amount: Decimal) -> NewPayment {
        let counterparty = match (payer, payee) {
            (PartyType::Buyer, _) | (_, PartyType::Buyer) => self.buyer.user_id,
            _ => self.farmer.user_id,
        };
        NewPayment {
            shop_id: Some(self.shop.shop_id),
            transaction_id: None,
            counterparty_id: Some(counterparty),
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

    pub async fn balance_of(&self, user_id: Uuid) -> Decimal {
        self.service
            .get_user(user_id)
            .await
            .expect("Failed to load user")
            .balance
    }
}
