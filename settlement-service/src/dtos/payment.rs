use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::SettlementError;
use crate::models::{NewPayment, PartyType, PaymentAllocation, PaymentMethod, PaymentStatus};
use crate::money;
use crate::services::fifo::PlannedSettlement;
use crate::services::guard::GuardEvaluation;
use crate::services::payments::PaymentReceipt;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreatePaymentRequest {
    /// Optional when the payment is linked to a transaction.
    pub shop_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    /// Farmer or buyer the payment concerns; derived from the transaction when omitted.
    pub counterparty_id: Option<Uuid>,
    #[validate(custom(function = "super::party_type"))]
    pub payer_type: String,
    #[validate(custom(function = "super::party_type"))]
    pub payee_type: String,
    #[validate(custom(function = "super::positive_amount"))]
    pub amount: Decimal,
    /// Defaults to CASH.
    #[validate(custom(function = "super::payment_method"))]
    pub method: Option<String>,
    /// Defaults to PAID.
    #[validate(custom(function = "super::payment_status"))]
    pub status: Option<String>,
    #[validate(length(max = 1000, message = "Notes must be at most 1000 characters"))]
    pub notes: Option<String>,
    pub payment_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub force_override: bool,
}

impl CreatePaymentRequest {
    /// Normalise into closed enums. Unknown values are rejected, never coerced.
    pub fn into_new_payment(self) -> Result<NewPayment, SettlementError> {
        let payer_type = PartyType::parse(&self.payer_type)
            .ok_or_else(|| SettlementError::invalid("payer_type", "unknown party type"))?;
        let payee_type = PartyType::parse(&self.payee_type)
            .ok_or_else(|| SettlementError::invalid("payee_type", "unknown party type"))?;
        let method = match self.method.as_deref() {
            None => PaymentMethod::default(),
            Some(raw) => PaymentMethod::parse(raw)
                .ok_or_else(|| SettlementError::invalid("method", "unknown payment method"))?,
        };
        let status = match self.status.as_deref() {
            None => PaymentStatus::Paid,
            Some(raw) => PaymentStatus::parse(raw)
                .ok_or_else(|| SettlementError::invalid("status", "unknown payment status"))?,
        };

        Ok(NewPayment {
            shop_id: self.shop_id,
            transaction_id: self.transaction_id,
            counterparty_id: self.counterparty_id,
            payer_type,
            payee_type,
            amount: self.amount,
            method,
            status,
            notes: self.notes.filter(|n| !n.trim().is_empty()),
            payment_date: self.payment_date,
            force_override: self.force_override,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdatePaymentStatusRequest {
    #[validate(custom(function = "super::payment_status"))]
    pub status: String,
}

impl UpdatePaymentStatusRequest {
    pub fn parsed(&self) -> Result<PaymentStatus, SettlementError> {
        PaymentStatus::parse(&self.status)
            .ok_or_else(|| SettlementError::invalid("status", "unknown payment status"))
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct GuardRequest {
    pub shop_id: Uuid,
    pub farmer_id: Uuid,
    #[validate(custom(function = "super::positive_amount"))]
    pub amount: Decimal,
    #[serde(default)]
    pub force_override: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationResponse {
    pub allocation_id: Uuid,
    pub transaction_id: Uuid,
    pub allocated_amount: String,
    pub allocated_cents: i64,
}

impl From<PaymentAllocation> for AllocationResponse {
    fn from(allocation: PaymentAllocation) -> Self {
        Self {
            allocation_id: allocation.allocation_id,
            transaction_id: allocation.transaction_id,
            allocated_amount: money::format_money(allocation.allocated_amount),
            allocated_cents: money::to_cents(allocation.allocated_amount),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentResponse {
    pub payment_id: Uuid,
    pub shop_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub counterparty_id: Option<Uuid>,
    pub payer_type: String,
    pub payee_type: String,
    pub direction: &'static str,
    pub amount: String,
    pub amount_cents: i64,
    pub method: String,
    pub status: String,
    pub force_override: bool,
    pub notes: Option<String>,
    pub payment_date: DateTime<Utc>,
    pub applied_to_expenses: Option<String>,
    pub applied_to_balance: Option<String>,
    pub balance_before: Option<String>,
    pub balance_after: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub allocations: Vec<AllocationResponse>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expense_settlements: Vec<PlannedSettlement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commission_realized: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<GuardEvaluation>,
}

fn upper(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

impl From<PaymentReceipt> for PaymentResponse {
    fn from(receipt: PaymentReceipt) -> Self {
        let payment = receipt.payment;
        let direction = payment.direction().as_str();
        let (expense_settlements, commission_realized) = match receipt.outcome {
            Some(outcome) => (
                outcome.expense_settlements,
                Some(money::format_money(outcome.allocation.commission_realized)),
            ),
            None => (Vec::new(), None),
        };

        Self {
            payment_id: payment.payment_id,
            shop_id: payment.shop_id,
            transaction_id: payment.transaction_id,
            counterparty_id: payment.counterparty_id,
            payer_type: upper(&payment.payer_type),
            payee_type: upper(&payment.payee_type),
            direction,
            amount: money::format_money(payment.amount),
            amount_cents: money::to_cents(payment.amount),
            method: upper(&payment.method),
            status: upper(&payment.status),
            force_override: payment.force_override,
            notes: payment.notes,
            payment_date: payment.payment_date,
            applied_to_expenses: payment.applied_to_expenses.map(money::format_money),
            applied_to_balance: payment.applied_to_balance.map(money::format_money),
            balance_before: payment.balance_before.map(money::format_money),
            balance_after: payment.balance_after.map(money::format_money),
            created_by: payment.created_by,
            created_utc: payment.created_utc,
            allocations: receipt
                .allocations
                .into_iter()
                .map(AllocationResponse::from)
                .collect(),
            expense_settlements,
            commission_realized,
            guard: receipt.guard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn request(body: serde_json::Value) -> CreatePaymentRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn enums_normalise_and_default() {
        let req = request(json!({
            "shop_id": Uuid::new_v4(),
            "counterparty_id": Uuid::new_v4(),
            "payer_type": "shop",
            "payee_type": "Farmer",
            "amount": "12.00"
        }));
        assert!(req.validate().is_ok());

        let payment = req.into_new_payment().unwrap();
        assert_eq!(payment.payer_type, PartyType::Shop);
        assert_eq!(payment.payee_type, PartyType::Farmer);
        assert_eq!(payment.method, PaymentMethod::Cash);
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert_eq!(payment.amount, dec!(12.00));
        assert!(!payment.force_override);
    }

    #[test]
    fn status_aliases_are_accepted() {
        let req = request(json!({
            "shop_id": Uuid::new_v4(),
            "payer_type": "BUYER",
            "payee_type": "SHOP",
            "amount": 300,
            "method": "upi",
            "status": "completed"
        }));
        let payment = req.into_new_payment().unwrap();
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert_eq!(payment.method, PaymentMethod::Upi);
    }

    #[test]
    fn unknown_method_is_rejected_not_defaulted() {
        let req = request(json!({
            "shop_id": Uuid::new_v4(),
            "payer_type": "BUYER",
            "payee_type": "SHOP",
            "amount": "10",
            "method": "crypto"
        }));
        let errors = req.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("method"));
        assert!(req.into_new_payment().is_err());
    }

    #[test]
    fn non_positive_amount_fails_validation() {
        let req = request(json!({
            "shop_id": Uuid::new_v4(),
            "payer_type": "BUYER",
            "payee_type": "SHOP",
            "amount": "0"
        }));
        let errors = req.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("amount"));
    }

    #[test]
    fn response_renders_money_as_fixed_strings() {
        let now = Utc::now();
        let payment = crate::models::Payment {
            payment_id: Uuid::new_v4(),
            shop_id: Uuid::new_v4(),
            transaction_id: None,
            counterparty_id: Some(Uuid::new_v4()),
            payer_type: "FARMER".to_string(),
            payee_type: "SHOP".to_string(),
            amount: dec!(50),
            method: "CASH".to_string(),
            status: "PAID".to_string(),
            force_override: false,
            notes: None,
            payment_date: now,
            applied_to_expenses: Some(dec!(30)),
            applied_to_balance: Some(dec!(20)),
            balance_before: Some(dec!(-30)),
            balance_after: Some(dec!(0)),
            created_by: None,
            created_utc: now,
        };
        let response = PaymentResponse::from(PaymentReceipt {
            payment,
            allocations: Vec::new(),
            guard: None,
            outcome: None,
        });

        assert_eq!(response.amount, "50.00");
        assert_eq!(response.amount_cents, 5000);
        assert_eq!(response.direction, "farmer_to_shop");
        assert_eq!(response.applied_to_expenses.as_deref(), Some("30.00"));
        assert_eq!(response.applied_to_balance.as_deref(), Some("20.00"));
        assert_eq!(response.balance_before.as_deref(), Some("-30.00"));

        let body = serde_json::to_value(&response).unwrap();
        assert!(body.get("guard").is_none());
        assert!(body.get("expense_settlements").is_none());
    }
}
