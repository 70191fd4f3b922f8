//! Payment intake, status transitions, the guard preview and FIFO preview.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::dtos::{
    CreatePaymentRequest, FifoPreviewRequest, GuardRequest, PaymentResponse,
    UpdatePaymentStatusRequest,
};
use crate::error::SettlementError;
use crate::handlers::{ActorId, ValidatedJson};
use crate::services::fifo::RepaymentPlan;
use crate::services::guard::GuardEvaluation;
use crate::startup::AppState;

/// Create a payment and run it through settlement.
///
/// POST /payments
#[tracing::instrument(skip(state, req), fields(actor_id = tracing::field::Empty))]
pub async fn create_payment(
    State(state): State<AppState>,
    actor: ActorId,
    ValidatedJson(req): ValidatedJson<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<PaymentResponse>), SettlementError> {
    let payment = req.into_new_payment()?;
    let receipt = state.settlement.create_payment(&payment, actor.0).await?;
    Ok((StatusCode::CREATED, Json(receipt.into())))
}

/// GET /payments/:payment_id
pub async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<PaymentResponse>, SettlementError> {
    let receipt = state.settlement.get_payment(payment_id).await?;
    Ok(Json(receipt.into()))
}

/// Move a PENDING payment to PAID, FAILED or CANCELLED.
///
/// PATCH /payments/:payment_id/status
#[tracing::instrument(skip(state, req), fields(actor_id = tracing::field::Empty))]
pub async fn update_payment_status(
    State(state): State<AppState>,
    actor: ActorId,
    Path(payment_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<UpdatePaymentStatusRequest>,
) -> Result<Json<PaymentResponse>, SettlementError> {
    let status = req.parsed()?;
    let receipt = state
        .settlement
        .update_payment_status(payment_id, status, actor.0)
        .await?;
    Ok(Json(receipt.into()))
}

/// Evaluate the debt guard for a prospective shop-to-farmer payment.
///
/// POST /payments/guard
pub async fn guard_preview(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<GuardRequest>,
) -> Result<Json<GuardEvaluation>, SettlementError> {
    let evaluation = state
        .settlement
        .will_shop_to_farmer_worsen_debt(req.shop_id, req.farmer_id, req.amount, req.force_override)
        .await?;
    Ok(Json(evaluation))
}

/// Dry-run FIFO repayment for a user.
///
/// POST /shops/:shop_id/users/:user_id/fifo
pub async fn fifo_preview(
    State(state): State<AppState>,
    Path((shop_id, user_id)): Path<(Uuid, Uuid)>,
    ValidatedJson(req): ValidatedJson<FifoPreviewRequest>,
) -> Result<Json<RepaymentPlan>, SettlementError> {
    let plan = state
        .settlement
        .apply_repayment_fifo(shop_id, user_id, req.amount, req.payment_id, true)
        .await?;
    Ok(Json(plan))
}
