use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;

use common::api::Life;
use common::params::EntityPath;

use super::{insert_error, Db};
use crate::error::{Error, Result};

/// Prefix of placeholder UUIDs reserving a model path before the remote
/// create has returned the real UUID.
pub const PLACEHOLDER_PREFIX: &str = "creating-";

#[derive(Debug, Clone, FromRow)]
pub struct ModelRecord {
    pub path: String,
    pub controller_path: String,
    pub uuid: String,
    pub cloud: String,
    pub cloud_region: String,
    pub credential_path: Option<String>,
    pub default_series: Option<String>,
    pub model_type: Option<String>,
    pub provider_type: Option<String>,
    pub life: String,
    pub status: Option<String>,
    pub status_message: Option<String>,
    pub status_since: Option<DateTime<Utc>>,
    pub agent_version: Option<String>,
    pub creator: String,
    pub usage_sender_credentials: Option<Vec<u8>>,
    #[sqlx(rename = "acl_read_json")]
    pub acl_read: Json<Vec<String>>,
    #[sqlx(rename = "acl_write_json")]
    pub acl_write: Json<Vec<String>>,
    #[sqlx(rename = "acl_admin_json")]
    pub acl_admin: Json<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelRecord {
    pub fn entity_path(&self) -> EntityPath {
        self.path
            .parse()
            .unwrap_or_else(|_| EntityPath::new("", self.path.clone()))
    }

    pub fn owner(&self) -> String {
        self.entity_path().user
    }

    pub fn controller_entity_path(&self) -> EntityPath {
        self.controller_path
            .parse()
            .unwrap_or_else(|_| EntityPath::new("", self.controller_path.clone()))
    }

    pub fn is_placeholder(&self) -> bool {
        self.uuid.starts_with(PLACEHOLDER_PREFIX)
    }

    pub fn life(&self) -> Life {
        match self.life.as_str() {
            "dying" => Life::Dying,
            "dead" => Life::Dead,
            _ => Life::Alive,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewModel {
    pub path: EntityPath,
    /// Set once a controller has been chosen; empty during reservation.
    pub controller_path: Option<EntityPath>,
    /// Placeholder UUID reserving the path.
    pub uuid: String,
    pub creator: String,
    pub credential_path: Option<String>,
    pub usage_sender_credentials: Option<Vec<u8>>,
}

/// Values written back once the remote create has succeeded.
#[derive(Debug, Clone)]
pub struct ModelReconcile {
    pub uuid: String,
    pub controller_path: EntityPath,
    pub cloud: String,
    pub cloud_region: String,
    pub default_series: Option<String>,
    pub model_type: Option<String>,
    pub provider_type: Option<String>,
    pub life: String,
    pub status: Option<String>,
    pub status_message: Option<String>,
    pub status_since: Option<DateTime<Utc>>,
    pub agent_version: Option<String>,
}

const MODEL_COLUMNS: &str = r#"
    path,
    controller_path,
    uuid,
    cloud,
    cloud_region,
    credential_path,
    default_series,
    model_type,
    provider_type,
    life,
    status,
    status_message,
    status_since,
    agent_version,
    creator,
    usage_sender_credentials,
    acl_read_json,
    acl_write_json,
    acl_admin_json,
    created_at,
    updated_at
"#;

/// Inserts the reservation row for a new model. The path and the (possibly
/// placeholder) UUID must both be unused.
pub async fn add_model(pool: &Db, new: NewModel) -> Result<ModelRecord> {
    sqlx::query(
        r#"
        INSERT INTO models (path, controller_path, uuid, creator, credential_path, usage_sender_credentials)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(new.path.to_string())
    .bind(new.controller_path.map(|p| p.to_string()).unwrap_or_default())
    .bind(&new.uuid)
    .bind(&new.creator)
    .bind(&new.credential_path)
    .bind(&new.usage_sender_credentials)
    .execute(pool)
    .await
    .map_err(|err| insert_error(err, &format!("model {}", new.path)))?;

    get_model(pool, &new.path)
        .await?
        .ok_or_else(|| Error::internal("model insert did not return row"))
}

pub async fn get_model(pool: &Db, path: &EntityPath) -> Result<Option<ModelRecord>> {
    let record = sqlx::query_as::<_, ModelRecord>(&format!(
        "SELECT {MODEL_COLUMNS} FROM models WHERE path = ?1"
    ))
    .bind(path.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn model_from_uuid(pool: &Db, uuid: &str) -> Result<Option<ModelRecord>> {
    let record = sqlx::query_as::<_, ModelRecord>(&format!(
        "SELECT {MODEL_COLUMNS} FROM models WHERE uuid = ?1"
    ))
    .bind(uuid)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn list_models(pool: &Db) -> Result<Vec<ModelRecord>> {
    let records = sqlx::query_as::<_, ModelRecord>(&format!(
        "SELECT {MODEL_COLUMNS} FROM models ORDER BY path ASC"
    ))
    .fetch_all(pool)
    .await?;

    Ok(records)
}

pub async fn delete_model(pool: &Db, path: &EntityPath) -> Result<()> {
    let result = sqlx::query("DELETE FROM models WHERE path = ?1")
        .bind(path.to_string())
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("model {path} not found")));
    }
    Ok(())
}

/// Removes a model addressed the way the monitor sees it: by owning
/// controller and remote UUID.
pub async fn delete_model_with_uuid(
    pool: &Db,
    controller: &EntityPath,
    uuid: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM models WHERE controller_path = ?1 AND uuid = ?2")
        .bind(controller.to_string())
        .bind(uuid)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_model_life(
    pool: &Db,
    controller: &EntityPath,
    uuid: &str,
    life: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE models
        SET life = ?3, updated_at = datetime('now')
        WHERE controller_path = ?1 AND uuid = ?2
        "#,
    )
    .bind(controller.to_string())
    .bind(uuid)
    .bind(life)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_model_controller(
    pool: &Db,
    path: &EntityPath,
    controller: &EntityPath,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE models
        SET controller_path = ?2, updated_at = datetime('now')
        WHERE path = ?1
        "#,
    )
    .bind(path.to_string())
    .bind(controller.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Replaces the placeholder reservation with the state of the remotely
/// created model and returns the updated row.
pub async fn reconcile_created_model(
    pool: &Db,
    path: &EntityPath,
    update: ModelReconcile,
) -> Result<ModelRecord> {
    sqlx::query(
        r#"
        UPDATE models
        SET uuid = ?2,
            controller_path = ?3,
            cloud = ?4,
            cloud_region = ?5,
            default_series = ?6,
            model_type = ?7,
            provider_type = ?8,
            life = ?9,
            status = ?10,
            status_message = ?11,
            status_since = ?12,
            agent_version = ?13,
            updated_at = datetime('now')
        WHERE path = ?1
        "#,
    )
    .bind(path.to_string())
    .bind(&update.uuid)
    .bind(update.controller_path.to_string())
    .bind(&update.cloud)
    .bind(&update.cloud_region)
    .bind(&update.default_series)
    .bind(&update.model_type)
    .bind(&update.provider_type)
    .bind(&update.life)
    .bind(&update.status)
    .bind(&update.status_message)
    .bind(update.status_since)
    .bind(&update.agent_version)
    .execute(pool)
    .await?;

    get_model(pool, path)
        .await?
        .ok_or_else(|| Error::internal(format!("cannot update model {} in database", update.uuid)))
}

/// Updates life/status/version for a model identified by controller and
/// UUID, as observed on the all-watcher stream.
pub async fn update_model_info(
    pool: &Db,
    controller: &EntityPath,
    uuid: &str,
    life: &str,
    status: Option<&str>,
    status_message: Option<&str>,
    agent_version: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE models
        SET life = ?3,
            status = COALESCE(?4, status),
            status_message = COALESCE(?5, status_message),
            agent_version = COALESCE(?6, agent_version),
            updated_at = datetime('now')
        WHERE controller_path = ?1 AND uuid = ?2
        "#,
    )
    .bind(controller.to_string())
    .bind(uuid)
    .bind(life)
    .bind(status)
    .bind(status_message)
    .bind(agent_version)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn count_for_controller(pool: &Db, controller: &EntityPath) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM models WHERE controller_path = ?1")
        .bind(controller.to_string())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn count_for_cloud(pool: &Db, cloud: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM models WHERE cloud = ?1")
        .bind(cloud)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Access level on a model's ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelAccess {
    Read,
    Write,
    Admin,
}

impl ModelAccess {
    pub fn parse(access: &str) -> Result<Self> {
        match access {
            "read" => Ok(ModelAccess::Read),
            "write" => Ok(ModelAccess::Write),
            "admin" => Ok(ModelAccess::Admin),
            other => Err(Error::bad_request(format!(
                "invalid model access {other:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelAccess::Read => "read",
            ModelAccess::Write => "write",
            ModelAccess::Admin => "admin",
        }
    }
}

fn add_to_set(set: &mut Vec<String>, user: &str) {
    if !set.iter().any(|u| u == user) {
        set.push(user.to_string());
    }
}

fn pull(set: &mut Vec<String>, user: &str) {
    set.retain(|u| u != user);
}

/// Adds the user to the ACL level (and every level below it, so a write
/// grant also confers read).
pub async fn grant_model(
    pool: &Db,
    path: &EntityPath,
    user: &str,
    access: ModelAccess,
) -> Result<()> {
    let model = get_model(pool, path)
        .await?
        .ok_or_else(|| Error::not_found(format!("model {path} not found")))?;

    let mut read = model.acl_read.0;
    let mut write = model.acl_write.0;
    let mut admin = model.acl_admin.0;
    match access {
        ModelAccess::Read => add_to_set(&mut read, user),
        ModelAccess::Write => {
            add_to_set(&mut read, user);
            add_to_set(&mut write, user);
        }
        ModelAccess::Admin => {
            add_to_set(&mut read, user);
            add_to_set(&mut write, user);
            add_to_set(&mut admin, user);
        }
    }
    write_acl(pool, path, read, write, admin).await
}

/// Removes the user from the ACL level and every level above it.
pub async fn revoke_model(
    pool: &Db,
    path: &EntityPath,
    user: &str,
    access: ModelAccess,
) -> Result<()> {
    let model = get_model(pool, path)
        .await?
        .ok_or_else(|| Error::not_found(format!("model {path} not found")))?;

    let mut read = model.acl_read.0;
    let mut write = model.acl_write.0;
    let mut admin = model.acl_admin.0;
    match access {
        ModelAccess::Read => {
            pull(&mut read, user);
            pull(&mut write, user);
            pull(&mut admin, user);
        }
        ModelAccess::Write => {
            pull(&mut write, user);
            pull(&mut admin, user);
        }
        ModelAccess::Admin => pull(&mut admin, user),
    }
    write_acl(pool, path, read, write, admin).await
}

async fn write_acl(
    pool: &Db,
    path: &EntityPath,
    read: Vec<String>,
    write: Vec<String>,
    admin: Vec<String>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE models
        SET acl_read_json = ?2, acl_write_json = ?3, acl_admin_json = ?4,
            updated_at = datetime('now')
        WHERE path = ?1
        "#,
    )
    .bind(path.to_string())
    .bind(Json(read))
    .bind(Json(write))
    .bind(Json(admin))
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations::init_test_db;

    fn reservation(name: &str, uuid: &str) -> NewModel {
        NewModel {
            path: EntityPath::new("alice", name),
            controller_path: None,
            uuid: uuid.to_string(),
            creator: "alice".to_string(),
            credential_path: None,
            usage_sender_credentials: None,
        }
    }

    #[tokio::test]
    async fn add_model_rejects_duplicate_path() {
        let db = init_test_db().await;
        add_model(&db, reservation("m", "creating-01")).await.expect("add");
        let err = add_model(&db, reservation("m", "creating-02"))
            .await
            .expect_err("duplicate path");
        assert_eq!(err.code(), crate::error::ErrorCode::AlreadyExists);
    }

    #[tokio::test]
    async fn reconcile_replaces_placeholder_uuid() {
        let db = init_test_db().await;
        let path = EntityPath::new("alice", "m");
        let reserved = add_model(&db, reservation("m", "creating-01")).await.expect("add");
        assert!(reserved.is_placeholder());

        let updated = reconcile_created_model(
            &db,
            &path,
            ModelReconcile {
                uuid: "0f5a9c9e-1111-4222-8333-444455556666".to_string(),
                controller_path: EntityPath::new("admin", "ctl"),
                cloud: "aws".to_string(),
                cloud_region: "eu-west-1".to_string(),
                default_series: Some("jammy".to_string()),
                model_type: Some("iaas".to_string()),
                provider_type: Some("ec2".to_string()),
                life: "alive".to_string(),
                status: Some("available".to_string()),
                status_message: None,
                status_since: None,
                agent_version: Some("2.9.33".to_string()),
            },
        )
        .await
        .expect("reconcile");

        assert!(!updated.is_placeholder());
        assert_eq!(updated.cloud, "aws");
        assert_eq!(updated.controller_path, "admin/ctl");
    }

    #[tokio::test]
    async fn grant_then_revoke_restores_prior_acl() {
        let db = init_test_db().await;
        let path = EntityPath::new("alice", "m");
        add_model(&db, reservation("m", "creating-01")).await.expect("add");

        grant_model(&db, &path, "bob", ModelAccess::Write).await.expect("grant");
        let model = get_model(&db, &path).await.expect("get").expect("row");
        assert!(model.acl_read.0.contains(&"bob".to_string()));
        assert!(model.acl_write.0.contains(&"bob".to_string()));

        revoke_model(&db, &path, "bob", ModelAccess::Read).await.expect("revoke");
        let model = get_model(&db, &path).await.expect("get").expect("row");
        assert!(model.acl_read.0.is_empty());
        assert!(model.acl_write.0.is_empty());
        assert!(model.acl_admin.0.is_empty());
    }

    #[tokio::test]
    async fn grant_is_idempotent() {
        let db = init_test_db().await;
        let path = EntityPath::new("alice", "m");
        add_model(&db, reservation("m", "creating-01")).await.expect("add");

        grant_model(&db, &path, "bob", ModelAccess::Read).await.expect("grant");
        grant_model(&db, &path, "bob", ModelAccess::Read).await.expect("grant again");
        let model = get_model(&db, &path).await.expect("get").expect("row");
        assert_eq!(model.acl_read.0, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn delete_with_uuid_targets_one_controller() {
        let db = init_test_db().await;
        let mut m1 = reservation("m1", "creating-01");
        m1.controller_path = Some(EntityPath::new("admin", "ctl1"));
        let mut m2 = reservation("m2", "creating-02");
        m2.controller_path = Some(EntityPath::new("admin", "ctl2"));
        add_model(&db, m1).await.expect("add m1");
        add_model(&db, m2).await.expect("add m2");

        delete_model_with_uuid(&db, &EntityPath::new("admin", "ctl1"), "creating-01")
            .await
            .expect("delete");
        assert!(get_model(&db, &EntityPath::new("alice", "m1"))
            .await
            .expect("get")
            .is_none());
        assert!(get_model(&db, &EntityPath::new("alice", "m2"))
            .await
            .expect("get")
            .is_some());
    }
}
