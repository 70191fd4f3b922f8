//! Shops, participants, sales and expenses.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::dtos::{
    CreateExpenseRequest, CreateShopRequest, CreateTransactionRequest, CreateUserRequest,
    SettleExpenseRequest, ShopResponse, UserResponse,
};
use crate::error::SettlementError;
use crate::handlers::{ActorId, ValidatedJson};
use crate::models::Transaction;
use crate::services::settlement::{
    ExpenseDetails, ManualSettlement, RecordedExpense, RecordedTransaction,
};
use crate::startup::AppState;

/// Register a shop together with its owner.
///
/// POST /shops
pub async fn create_shop(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<CreateShopRequest>,
) -> Result<(StatusCode, Json<ShopResponse>), SettlementError> {
    let created = state.settlement.create_shop(&req.into()).await?;
    Ok((StatusCode::CREATED, Json(created.into())))
}

/// Register a farmer or buyer under a shop.
///
/// POST /shops/:shop_id/users
pub async fn create_user(
    State(state): State<AppState>,
    Path(shop_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), SettlementError> {
    let input = req.into_create_user(shop_id)?;
    let user = state.settlement.create_user(&input).await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

/// GET /users/:user_id
pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UserResponse>, SettlementError> {
    let user = state.settlement.get_user(user_id).await?;
    Ok(Json(user.into()))
}

/// Record a sale and recompute both parties.
///
/// POST /transactions
pub async fn create_transaction(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<CreateTransactionRequest>,
) -> Result<(StatusCode, Json<RecordedTransaction>), SettlementError> {
    let recorded = state.settlement.create_transaction(&req.into()).await?;
    Ok((StatusCode::CREATED, Json(recorded)))
}

/// GET /transactions/:transaction_id
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
) -> Result<Json<Transaction>, SettlementError> {
    Ok(Json(state.settlement.get_transaction(transaction_id).await?))
}

/// Record an expense, advance or adjustment against a user.
///
/// POST /expenses
#[tracing::instrument(skip(state, req), fields(actor_id = tracing::field::Empty))]
pub async fn create_expense(
    State(state): State<AppState>,
    actor: ActorId,
    ValidatedJson(req): ValidatedJson<CreateExpenseRequest>,
) -> Result<(StatusCode, Json<RecordedExpense>), SettlementError> {
    let input = req.into_create_expense()?;
    let recorded = state.settlement.create_expense(&input, actor.0).await?;
    Ok((StatusCode::CREATED, Json(recorded)))
}

/// GET /expenses/:expense_id
pub async fn get_expense(
    State(state): State<AppState>,
    Path(expense_id): Path<Uuid>,
) -> Result<Json<ExpenseDetails>, SettlementError> {
    Ok(Json(state.settlement.get_expense(expense_id).await?))
}

/// Settle an explicit amount against one expense.
///
/// POST /expenses/:expense_id/settle
pub async fn settle_expense(
    State(state): State<AppState>,
    Path(expense_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<SettleExpenseRequest>,
) -> Result<Json<ManualSettlement>, SettlementError> {
    let settled = state
        .settlement
        .settle_expense_amount(expense_id, req.amount, req.notes)
        .await?;
    Ok(Json(settled))
}
