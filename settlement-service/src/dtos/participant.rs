use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::SettlementError;
use crate::models::{
    CreateExpense, CreateShop, CreateTransaction, CreateUser, ExpenseType, Shop, User, UserRole,
};
use crate::money;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateShopRequest {
    #[validate(length(min = 1, max = 200, message = "Shop name is required"))]
    pub name: String,
    #[validate(length(min = 1, max = 100, message = "Owner username is required"))]
    pub owner_username: String,
}

impl From<CreateShopRequest> for CreateShop {
    fn from(req: CreateShopRequest) -> Self {
        Self {
            name: req.name.trim().to_string(),
            owner_username: req.owner_username.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShopResponse {
    pub shop_id: Uuid,
    pub name: String,
    pub owner: UserResponse,
    pub created_utc: DateTime<Utc>,
}

impl From<(Shop, User)> for ShopResponse {
    fn from((shop, owner): (Shop, User)) -> Self {
        Self {
            shop_id: shop.shop_id,
            name: shop.name,
            owner: owner.into(),
            created_utc: shop.created_utc,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateUserRequest {
    #[validate(length(min = 1, max = 100, message = "Username is required"))]
    pub username: String,
    #[validate(custom(function = "super::participant_role"))]
    pub role: String,
}

impl CreateUserRequest {
    pub fn into_create_user(self, shop_id: Uuid) -> Result<CreateUser, SettlementError> {
        let role = UserRole::parse(&self.role)
            .ok_or_else(|| SettlementError::invalid("role", "unknown role"))?;
        Ok(CreateUser {
            shop_id,
            username: self.username.trim().to_string(),
            role,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserResponse {
    pub user_id: Uuid,
    pub shop_id: Option<Uuid>,
    pub username: String,
    pub role: String,
    pub balance: String,
    pub balance_cents: i64,
    pub cumulative_value: String,
    pub cumulative_value_cents: i64,
    pub created_utc: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            user_id: user.user_id,
            shop_id: user.shop_id,
            username: user.username,
            role: user.role,
            balance: money::format_money(user.balance),
            balance_cents: money::to_cents(user.balance),
            cumulative_value: money::format_money(user.cumulative_value),
            cumulative_value_cents: money::to_cents(user.cumulative_value),
            created_utc: user.created_utc,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateTransactionRequest {
    pub shop_id: Uuid,
    pub farmer_id: Uuid,
    pub buyer_id: Uuid,
    #[validate(custom(function = "super::positive_amount"))]
    pub total_amount: Decimal,
    #[validate(custom(function = "super::non_negative_amount"))]
    pub commission_amount: Decimal,
    #[validate(custom(function = "super::non_negative_amount"))]
    pub farmer_earning: Decimal,
    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: Option<String>,
    pub transaction_date: Option<DateTime<Utc>>,
}

impl From<CreateTransactionRequest> for CreateTransaction {
    fn from(req: CreateTransactionRequest) -> Self {
        Self {
            shop_id: req.shop_id,
            farmer_id: req.farmer_id,
            buyer_id: req.buyer_id,
            total_amount: req.total_amount,
            commission_amount: req.commission_amount,
            farmer_earning: req.farmer_earning,
            description: req.description,
            transaction_date: req.transaction_date,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateExpenseRequest {
    pub shop_id: Uuid,
    pub user_id: Uuid,
    #[validate(custom(function = "super::positive_amount"))]
    pub amount: Decimal,
    /// Defaults to `expense`.
    #[validate(custom(function = "super::expense_type"))]
    pub expense_type: Option<String>,
    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: Option<String>,
    pub transaction_id: Option<Uuid>,
}

impl CreateExpenseRequest {
    pub fn into_create_expense(self) -> Result<CreateExpense, SettlementError> {
        let expense_type = match self.expense_type.as_deref() {
            None => ExpenseType::Expense,
            Some(raw) => ExpenseType::parse(raw)
                .ok_or_else(|| SettlementError::invalid("expense_type", "unknown expense type"))?,
        };
        Ok(CreateExpense {
            shop_id: self.shop_id,
            user_id: self.user_id,
            amount: self.amount,
            expense_type,
            description: self.description,
            transaction_id: self.transaction_id,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SettleExpenseRequest {
    #[validate(custom(function = "super::positive_amount"))]
    pub amount: Decimal,
    #[validate(length(max = 500, message = "Notes must be at most 500 characters"))]
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn user_response_carries_cents() {
        let user = User {
            user_id: Uuid::new_v4(),
            shop_id: None,
            username: "owner".to_string(),
            role: "owner".to_string(),
            balance: dec!(-100),
            cumulative_value: dec!(15.005),
            created_utc: Utc::now(),
        };
        let response = UserResponse::from(user);
        assert_eq!(response.balance, "-100.00");
        assert_eq!(response.balance_cents, -10000);
        assert_eq!(response.cumulative_value, "15.01");
        assert_eq!(response.cumulative_value_cents, 1501);
    }

    #[test]
    fn expense_type_defaults_to_expense() {
        let req: CreateExpenseRequest = serde_json::from_value(json!({
            "shop_id": Uuid::new_v4(),
            "user_id": Uuid::new_v4(),
            "amount": "300"
        }))
        .unwrap();
        assert!(req.validate().is_ok());
        assert_eq!(req.into_create_expense().unwrap().expense_type, ExpenseType::Expense);
    }

    #[test]
    fn owner_role_fails_validation() {
        let req: CreateUserRequest = serde_json::from_value(json!({
            "username": "someone",
            "role": "owner"
        }))
        .unwrap();
        assert!(req.validate().unwrap_err().field_errors().contains_key("role"));
    }

    #[test]
    fn transaction_request_rejects_negative_split() {
        let req: CreateTransactionRequest = serde_json::from_value(json!({
            "shop_id": Uuid::new_v4(),
            "farmer_id": Uuid::new_v4(),
            "buyer_id": Uuid::new_v4(),
            "total_amount": "1000",
            "commission_amount": "-50",
            "farmer_earning": "1050"
        }))
        .unwrap();
        let errors = req.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("commission_amount"));
    }
}
