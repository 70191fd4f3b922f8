//! Application startup and lifecycle management.

use crate::config::SettlementConfig;
use crate::handlers;
use crate::services::{init_metrics, Database, SettlementService};
use axum::{
    extract::Request,
    middleware,
    routing::{get, patch, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::{request_id, request_id_middleware};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: SettlementConfig,
    pub db: Arc<Database>,
    pub settlement: SettlementService,
}

/// Route table; shared by the server and the router tests.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/shops", post(handlers::create_shop))
        .route("/shops/:shop_id/users", post(handlers::create_user))
        .route("/shops/:shop_id/users/:user_id/fifo", post(handlers::fifo_preview))
        .route("/shops/:shop_id/audit", get(handlers::audit_shop))
        .route("/shops/:shop_id/drift", get(handlers::find_drifted_users))
        .route("/shops/:shop_id/report", get(handlers::balance_report))
        .route("/users/:user_id", get(handlers::get_user))
        .route("/users/:user_id/ledger", get(handlers::list_ledger_entries))
        .route("/users/:user_id/breakdown", get(handlers::balance_breakdown))
        .route("/users/:user_id/recompute", post(handlers::recompute_balance))
        .route(
            "/users/:user_id/reconciliation",
            get(handlers::reconcile_user_balance),
        )
        .route(
            "/users/:user_id/reconciliation/fix",
            post(handlers::fix_user_balance),
        )
        .route("/transactions", post(handlers::create_transaction))
        .route(
            "/transactions/:transaction_id",
            get(handlers::get_transaction),
        )
        .route("/expenses", post(handlers::create_expense))
        .route("/expenses/:expense_id", get(handlers::get_expense))
        .route("/expenses/:expense_id/settle", post(handlers::settle_expense))
        .route("/payments", post(handlers::create_payment))
        .route("/payments/guard", post(handlers::guard_preview))
        .route("/payments/:payment_id", get(handlers::get_payment))
        .route(
            "/payments/:payment_id/status",
            patch(handlers::update_payment_status),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    tracing::info_span!(
                        "http_request",
                        method = %req.method(),
                        uri = %req.uri(),
                        request_id = %request_id(req.headers()).unwrap_or_default(),
                    )
                })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: SettlementConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: SettlementConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: SettlementConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let settlement = SettlementService::new(db.clone(), config.settlement.clone());

        let addr = config.common.socket_addr();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            port = port,
            allocate_standalone_buyer_payments = config.settlement.allocate_standalone_buyer_payments,
            expense_clawback_window_days = config.settlement.expense_clawback_window_days,
            "Settlement service listener bound"
        );

        Ok(Self {
            port,
            listener,
            state: AppState {
                config,
                db,
                settlement,
            },
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let app = router(self.state);

        tracing::info!(
            service = "settlement-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, app).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
