//! Configuration module for settlement-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub settlement: SettlementSettings,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Business switches for the settlement engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementSettings {
    /// FIFO-allocate standalone buyer payments across open purchases instead of
    /// keeping them as unallocated bookkeeping credits.
    pub allocate_standalone_buyer_payments: bool,
    /// Look-back for clawing back recent farmer payments when an expense is
    /// recorded. Zero disables the compensation.
    pub expense_clawback_window_days: i32,
}

impl Default for SettlementSettings {
    fn default() -> Self {
        Self {
            allocate_standalone_buyer_payments: false,
            expense_clawback_window_days: 30,
        }
    }
}

impl SettlementSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            allocate_standalone_buyer_payments: env::var("ALLOCATE_STANDALONE_BUYER_PAYMENTS")
                .ok()
                .map(|s| parse_flag(&s))
                .unwrap_or(defaults.allocate_standalone_buyer_payments),
            expense_clawback_window_days: env::var("EXPENSE_CLAWBACK_WINDOW_DAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|days: &i32| *days >= 0)
                .unwrap_or(defaults.expense_clawback_window_days),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl SettlementConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "settlement-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            settlement: SettlementSettings::from_env(),
        })
    }
}
