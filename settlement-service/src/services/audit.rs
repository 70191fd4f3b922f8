//! Audit-log sink. Every sanctioned mutation leaves one record here.

use crate::error::SettlementError;
use crate::models::AuditLog;
use crate::services::db_error;
use sqlx::PgConnection;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub shop_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub action: &'static str,
    pub entity_type: &'static str,
    pub entity_id: Option<Uuid>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: serde_json::Value,
}

pub async fn record(conn: &mut PgConnection, entry: AuditRecord) -> Result<(), SettlementError> {
    sqlx::query(
        r#"
        INSERT INTO audit_logs (audit_id, shop_id, actor_id, action, entity_type, entity_id, old_values, new_values)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(entry.shop_id)
    .bind(entry.actor_id)
    .bind(entry.action)
    .bind(entry.entity_type)
    .bind(entry.entity_id)
    .bind(entry.old_values)
    .bind(entry.new_values)
    .execute(conn)
    .await
    .map_err(db_error("Failed to write audit log"))?;
    Ok(())
}

/// Audit trail of one entity, oldest first.
pub async fn list_for_entity(
    conn: &mut PgConnection,
    entity_type: &str,
    entity_id: Uuid,
) -> Result<Vec<AuditLog>, SettlementError> {
    sqlx::query_as::<_, AuditLog>(
        r#"
        SELECT audit_id, shop_id, actor_id, action, entity_type, entity_id, old_values, new_values, created_utc
        FROM audit_logs
        WHERE entity_type = $1 AND entity_id = $2
        ORDER BY created_utc, seq
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .fetch_all(conn)
    .await
    .map_err(db_error("Failed to list audit logs"))
}
