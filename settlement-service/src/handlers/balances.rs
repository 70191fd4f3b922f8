//! Balances, the ledger and reconciliation.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use uuid::Uuid;
use validator::Validate;

use crate::dtos::LedgerQuery;
use crate::error::SettlementError;
use crate::handlers::ActorId;
use crate::models::LedgerEntry;
use crate::services::balance::{BalanceBreakdown, BalanceChange};
use crate::services::reconciliation::{
    BalanceDrift, BalanceFix, BalanceReport, ShopAuditReport, UserReconciliation,
};
use crate::startup::AppState;
use service_core::error::AppError;

/// POST /users/:user_id/recompute
pub async fn recompute_balance(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<BalanceChange>, SettlementError> {
    Ok(Json(state.settlement.recompute_balance(user_id).await?))
}

/// GET /users/:user_id/breakdown
pub async fn balance_breakdown(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<BalanceBreakdown>, SettlementError> {
    Ok(Json(state.settlement.balance_breakdown(user_id).await?))
}

/// GET /users/:user_id/ledger
pub async fn list_ledger_entries(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<Vec<LedgerEntry>>, AppError> {
    query.validate()?;
    let entries = state
        .settlement
        .list_ledger_entries(user_id, query.limit())
        .await?;
    Ok(Json(entries))
}

/// GET /users/:user_id/reconciliation
pub async fn reconcile_user_balance(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UserReconciliation>, SettlementError> {
    Ok(Json(state.settlement.reconcile_user_balance(user_id).await?))
}

/// Overwrite a user's stored balance with the ledger-derived value.
///
/// POST /users/:user_id/reconciliation/fix
#[tracing::instrument(skip(state), fields(actor_id = tracing::field::Empty))]
pub async fn fix_user_balance(
    State(state): State<AppState>,
    actor: ActorId,
    Path(user_id): Path<Uuid>,
) -> Result<Json<BalanceFix>, SettlementError> {
    Ok(Json(
        state
            .settlement
            .fix_user_balance_discrepancy(user_id, actor.0)
            .await?,
    ))
}

/// GET /shops/:shop_id/audit
pub async fn audit_shop(
    State(state): State<AppState>,
    Path(shop_id): Path<Uuid>,
) -> Result<Json<ShopAuditReport>, SettlementError> {
    Ok(Json(state.settlement.audit_shop_balances(shop_id).await?))
}

/// GET /shops/:shop_id/drift
pub async fn find_drifted_users(
    State(state): State<AppState>,
    Path(shop_id): Path<Uuid>,
) -> Result<Json<Vec<BalanceDrift>>, SettlementError> {
    Ok(Json(state.settlement.find_drifted_users(shop_id).await?))
}

/// GET /shops/:shop_id/report
pub async fn balance_report(
    State(state): State<AppState>,
    actor: ActorId,
    Path(shop_id): Path<Uuid>,
) -> Result<Json<BalanceReport>, SettlementError> {
    Ok(Json(
        state
            .settlement
            .generate_balance_report(shop_id, actor.0)
            .await?,
    ))
}
