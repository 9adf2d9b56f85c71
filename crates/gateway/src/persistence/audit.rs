use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::Db;
use crate::error::Result;

/// Typed audit entries. Payloads never contain credential secret values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AuditEntry {
    ModelCreated {
        path: String,
        uuid: String,
        owner: String,
        creator: String,
        controller_path: String,
        cloud: String,
        region: String,
    },
    ModelDestroyed {
        path: String,
        uuid: String,
        /// The principal that initiated the destroy.
        initiator: String,
    },
    CloudCreated {
        cloud: String,
        controller_path: String,
        creator: String,
    },
    CloudRemoved {
        cloud: String,
        initiator: String,
    },
}

impl AuditEntry {
    pub fn type_name(&self) -> &'static str {
        match self {
            AuditEntry::ModelCreated { .. } => "model-created",
            AuditEntry::ModelDestroyed { .. } => "model-destroyed",
            AuditEntry::CloudCreated { .. } => "cloud-created",
            AuditEntry::CloudRemoved { .. } => "cloud-removed",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AuditRecord {
    pub id: i64,
    pub entry_type: String,
    pub created_at: DateTime<Utc>,
    pub payload_json: String,
}

impl AuditRecord {
    pub fn entry(&self) -> Option<AuditEntry> {
        serde_json::from_str(&self.payload_json).ok()
    }
}

pub async fn append_audit(pool: &Db, at: DateTime<Utc>, entry: &AuditEntry) -> Result<()> {
    let payload = serde_json::to_string(entry)
        .map_err(|err| crate::error::Error::internal("cannot encode audit entry").with_cause(err))?;
    sqlx::query(
        r#"
        INSERT INTO audit_log (entry_type, created_at, payload_json)
        VALUES (?1, ?2, ?3)
        "#,
    )
    .bind(entry.type_name())
    .bind(at)
    .bind(payload)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_audit(pool: &Db, limit: u32) -> Result<Vec<AuditRecord>> {
    let records = sqlx::query_as::<_, AuditRecord>(
        r#"
        SELECT id, entry_type, created_at, payload_json
        FROM audit_log
        ORDER BY id DESC
        LIMIT ?1
        "#,
    )
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn grant_audit_log_access(pool: &Db, username: &str, granted_by: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO audit_log_access (username, granted_by)
        VALUES (?1, ?2)
        "#,
    )
    .bind(username)
    .bind(granted_by)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn has_audit_log_access(pool: &Db, username: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log_access WHERE username = ?1")
        .bind(username)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}
