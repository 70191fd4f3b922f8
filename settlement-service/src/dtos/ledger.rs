use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

/// FIFO preview. The HTTP surface only ever dry-runs.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct FifoPreviewRequest {
    #[validate(custom(function = "super::non_negative_amount"))]
    pub amount: Decimal,
    pub payment_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct LedgerQuery {
    #[validate(range(min = 1, max = 500, message = "Limit must be between 1 and 500"))]
    pub limit: Option<i64>,
}

impl LedgerQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(100)
    }
}
