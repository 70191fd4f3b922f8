//! Payment vocabulary: parties, statuses, methods and the direction they imply.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Who pays or receives a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartyType {
    Buyer,
    Shop,
    Farmer,
    External,
}

impl PartyType {
    pub const ALL: [PartyType; 4] = [Self::Buyer, Self::Shop, Self::Farmer, Self::External];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buyer => "BUYER",
            Self::Shop => "SHOP",
            Self::Farmer => "FARMER",
            Self::External => "EXTERNAL",
        }
    }

    /// Case-insensitive parse of a boundary value.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = input.trim().to_ascii_uppercase();
        Self::ALL.into_iter().find(|p| p.as_str() == normalized)
    }
}

impl fmt::Display for PartyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Case-insensitive parse; accepts `COMPLETED` for PAID and `CANCELED` for CANCELLED.
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "PAID" | "COMPLETED" => Some(Self::Paid),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" | "CANCELED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// No transition leaves PAID, FAILED or CANCELLED.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    #[default]
    Cash,
    Upi,
    BankTransfer,
    Card,
    Cheque,
    Other,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 6] = [
        Self::Cash,
        Self::Upi,
        Self::BankTransfer,
        Self::Card,
        Self::Cheque,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cash => "CASH",
            Self::Upi => "UPI",
            Self::BankTransfer => "BANK_TRANSFER",
            Self::Card => "CARD",
            Self::Cheque => "CHEQUE",
            Self::Other => "OTHER",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        let normalized = input.trim().to_ascii_uppercase();
        Self::ALL.into_iter().find(|m| m.as_str() == normalized)
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Money flow implied by a payer/payee pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentDirection {
    /// Buyer settles a purchase.
    BuyerToShop,
    /// Shop pays out farmer earnings.
    ShopToFarmer,
    /// Farmer repays the shop.
    FarmerToShop,
    /// Shop refunds a buyer.
    ShopToBuyer,
    Other,
}

impl PaymentDirection {
    pub fn of(payer: PartyType, payee: PartyType) -> Self {
        match (payer, payee) {
            (PartyType::Buyer, PartyType::Shop) => Self::BuyerToShop,
            (PartyType::Shop, PartyType::Farmer) => Self::ShopToFarmer,
            (PartyType::Farmer, PartyType::Shop) => Self::FarmerToShop,
            (PartyType::Shop, PartyType::Buyer) => Self::ShopToBuyer,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuyerToShop => "buyer_to_shop",
            Self::ShopToFarmer => "shop_to_farmer",
            Self::FarmerToShop => "farmer_to_shop",
            Self::ShopToBuyer => "shop_to_buyer",
            Self::Other => "other",
        }
    }

    /// Directions whose payments are spread over transactions.
    pub fn allocates(&self) -> bool {
        matches!(self, Self::BuyerToShop | Self::ShopToFarmer)
    }

    /// Directions that repay the farmer's outstanding expenses.
    pub fn settles_expenses(&self) -> bool {
        matches!(self, Self::ShopToFarmer | Self::FarmerToShop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parties_parse_case_insensitively() {
        assert_eq!(PartyType::parse("buyer"), Some(PartyType::Buyer));
        assert_eq!(PartyType::parse(" Shop "), Some(PartyType::Shop));
        assert_eq!(PartyType::parse("FARMER"), Some(PartyType::Farmer));
        assert_eq!(PartyType::parse("owner"), None);
    }

    #[test]
    fn status_aliases() {
        assert_eq!(PaymentStatus::parse("completed"), Some(PaymentStatus::Paid));
        assert_eq!(PaymentStatus::parse("Canceled"), Some(PaymentStatus::Cancelled));
        assert_eq!(PaymentStatus::parse("refunded"), None);
        assert!(PaymentStatus::Paid.is_terminal());
        assert!(!PaymentStatus::Pending.is_terminal());
    }

    #[test]
    fn methods_parse_and_default_to_cash() {
        assert_eq!(PaymentMethod::parse("bank_transfer"), Some(PaymentMethod::BankTransfer));
        assert_eq!(PaymentMethod::parse("upi"), Some(PaymentMethod::Upi));
        assert_eq!(PaymentMethod::parse("crypto"), None);
        assert_eq!(PaymentMethod::default(), PaymentMethod::Cash);
    }

    #[test]
    fn enums_serialize_upper_case() {
        assert_eq!(
            serde_json::to_string(&PaymentMethod::BankTransfer).unwrap(),
            "\"BANK_TRANSFER\""
        );
        assert_eq!(serde_json::to_string(&PartyType::Shop).unwrap(), "\"SHOP\"");
    }

    #[test]
    fn direction_from_parties() {
        assert_eq!(
            PaymentDirection::of(PartyType::Buyer, PartyType::Shop),
            PaymentDirection::BuyerToShop
        );
        assert_eq!(
            PaymentDirection::of(PartyType::Farmer, PartyType::Shop),
            PaymentDirection::FarmerToShop
        );
        assert_eq!(
            PaymentDirection::of(PartyType::External, PartyType::Shop),
            PaymentDirection::Other
        );
        assert!(PaymentDirection::ShopToFarmer.allocates());
        assert!(PaymentDirection::ShopToFarmer.settles_expenses());
        assert!(!PaymentDirection::FarmerToShop.allocates());
    }
}
