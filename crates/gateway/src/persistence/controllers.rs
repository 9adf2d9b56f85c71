use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;

use common::params::EntityPath;

use super::{insert_error, Db};
use crate::error::{Error, Result};

#[derive(Debug, Clone, FromRow)]
pub struct ControllerRecord {
    pub path: String,
    pub uuid: String,
    #[sqlx(rename = "hosts_json")]
    pub hosts: Json<Vec<String>>,
    pub ca_cert: Option<String>,
    pub admin_user: String,
    pub admin_password: String,
    pub public: bool,
    pub deprecated: bool,
    pub agent_version: Option<String>,
    pub unavailable_since: Option<DateTime<Utc>>,
    pub monitor_lease_owner: Option<String>,
    pub monitor_lease_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ControllerRecord {
    pub fn entity_path(&self) -> EntityPath {
        self.path
            .parse()
            .unwrap_or_else(|_| EntityPath::new("", self.path.clone()))
    }

    pub fn available(&self) -> bool {
        self.unavailable_since.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct NewController {
    pub path: EntityPath,
    pub uuid: String,
    pub hosts: Vec<String>,
    pub ca_cert: Option<String>,
    pub admin_user: String,
    pub admin_password: String,
    pub public: bool,
}

const CONTROLLER_COLUMNS: &str = r#"
    path,
    uuid,
    hosts_json,
    ca_cert,
    admin_user,
    admin_password,
    public,
    deprecated,
    agent_version,
    unavailable_since,
    monitor_lease_owner,
    monitor_lease_expiry,
    created_at,
    updated_at
"#;

pub async fn add_controller(pool: &Db, new: NewController) -> Result<ControllerRecord> {
    sqlx::query(
        r#"
        INSERT INTO controllers (path, uuid, hosts_json, ca_cert, admin_user, admin_password, public)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(new.path.to_string())
    .bind(&new.uuid)
    .bind(Json(&new.hosts))
    .bind(&new.ca_cert)
    .bind(&new.admin_user)
    .bind(&new.admin_password)
    .bind(new.public)
    .execute(pool)
    .await
    .map_err(|err| insert_error(err, &format!("controller {}", new.path)))?;

    get_controller(pool, &new.path)
        .await?
        .ok_or_else(|| Error::internal("controller insert did not return row"))
}

pub async fn get_controller(pool: &Db, path: &EntityPath) -> Result<Option<ControllerRecord>> {
    let record = sqlx::query_as::<_, ControllerRecord>(&format!(
        "SELECT {CONTROLLER_COLUMNS} FROM controllers WHERE path = ?1"
    ))
    .bind(path.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Deletes a controller. Refuses while any model still references it.
pub async fn delete_controller(pool: &Db, path: &EntityPath) -> Result<()> {
    let mut tx = pool.begin().await?;
    let path_str = path.to_string();

    let in_use: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM models WHERE controller_path = ?1")
            .bind(&path_str)
            .fetch_one(&mut *tx)
            .await?;
    if in_use > 0 {
        return Err(Error::bad_request(format!(
            "controller {path} is still in use by {in_use} model(s)"
        )));
    }

    let result = sqlx::query("DELETE FROM controllers WHERE path = ?1")
        .bind(&path_str)
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("controller {path} not found")));
    }

    sqlx::query("DELETE FROM controller_credential_updates WHERE controller_path = ?1")
        .bind(&path_str)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn list_controllers(pool: &Db) -> Result<Vec<ControllerRecord>> {
    let records = sqlx::query_as::<_, ControllerRecord>(&format!(
        "SELECT {CONTROLLER_COLUMNS} FROM controllers ORDER BY path ASC"
    ))
    .fetch_all(pool)
    .await?;

    Ok(records)
}

pub async fn set_agent_version(pool: &Db, path: &EntityPath, version: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE controllers
        SET agent_version = ?2, updated_at = datetime('now')
        WHERE path = ?1
        "#,
    )
    .bind(path.to_string())
    .bind(version)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_deprecated(pool: &Db, path: &EntityPath, deprecated: bool) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE controllers
        SET deprecated = ?2, updated_at = datetime('now')
        WHERE path = ?1
        "#,
    )
    .bind(path.to_string())
    .bind(deprecated)
    .execute(pool)
    .await?;
    Ok(())
}

/// Records the time a controller became unreachable. Only the first failure
/// in an outage sets the timestamp.
pub async fn set_unavailable_at(pool: &Db, path: &EntityPath, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE controllers
        SET unavailable_since = ?2, updated_at = datetime('now')
        WHERE path = ?1 AND unavailable_since IS NULL
        "#,
    )
    .bind(path.to_string())
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear_unavailable(pool: &Db, path: &EntityPath) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE controllers
        SET unavailable_since = NULL, updated_at = datetime('now')
        WHERE path = ?1 AND unavailable_since IS NOT NULL
        "#,
    )
    .bind(path.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Outcome of a lease compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The swap succeeded; the stored lease is now (new_owner, new_expiry).
    Acquired,
    /// Another replica changed the lease first; the stored values are
    /// returned so the caller can re-evaluate.
    Mismatch {
        owner: Option<String>,
        expiry: Option<DateTime<Utc>>,
    },
}

/// Compare-and-swap on the monitor lease columns. The swap applies only if
/// the stored `(owner, expiry)` still equals `(old_owner, old_expiry)`.
/// Passing `new_owner = None` releases the lease. Fails with
/// `MonitoringStopped` when the controller row has been removed.
pub async fn acquire_monitor_lease(
    pool: &Db,
    path: &EntityPath,
    old_expiry: Option<DateTime<Utc>>,
    old_owner: Option<&str>,
    new_owner: Option<&str>,
    new_expiry: Option<DateTime<Utc>>,
) -> Result<LeaseOutcome> {
    let path_str = path.to_string();
    let result = sqlx::query(
        r#"
        UPDATE controllers
        SET monitor_lease_owner = ?4, monitor_lease_expiry = ?5, updated_at = datetime('now')
        WHERE path = ?1 AND monitor_lease_owner IS ?2 AND monitor_lease_expiry IS ?3
        "#,
    )
    .bind(&path_str)
    .bind(old_owner)
    .bind(old_expiry)
    .bind(new_owner)
    .bind(new_expiry)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        return Ok(LeaseOutcome::Acquired);
    }

    let stored = sqlx::query_as::<_, (Option<String>, Option<DateTime<Utc>>)>(
        "SELECT monitor_lease_owner, monitor_lease_expiry FROM controllers WHERE path = ?1",
    )
    .bind(&path_str)
    .fetch_optional(pool)
    .await?;

    match stored {
        None => Err(Error::monitoring_stopped(format!(
            "controller {path} has been removed"
        ))),
        Some((owner, expiry)) => Ok(LeaseOutcome::Mismatch { owner, expiry }),
    }
}
