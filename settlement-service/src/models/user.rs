//! Marketplace participants.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Owner,
    Farmer,
    Buyer,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Farmer => "farmer",
            Self::Buyer => "buyer",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "owner" => Some(Self::Owner),
            "farmer" => Some(Self::Farmer),
            "buyer" => Some(Self::Buyer),
            _ => None,
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A participant with its cached balance.
///
/// Farmer balance is what the shop owes the farmer net of outstanding
/// expenses; buyer balance is what the buyer still owes. `cumulative_value`
/// is only meaningful for owners: lifetime realized commission.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub user_id: Uuid,
    pub shop_id: Option<Uuid>,
    pub username: String,
    pub role: String,
    #[serde(serialize_with = "crate::money::serialize")]
    pub balance: Decimal,
    #[serde(serialize_with = "crate::money::serialize")]
    pub cumulative_value: Decimal,
    pub created_utc: DateTime<Utc>,
}

impl User {
    pub fn parsed_role(&self) -> Option<UserRole> {
        UserRole::parse(&self.role)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Shop {
    pub shop_id: Uuid,
    pub owner_id: Option<Uuid>,
    pub name: String,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateShop {
    pub name: String,
    pub owner_username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUser {
    pub shop_id: Uuid,
    pub username: String,
    pub role: UserRole,
}
