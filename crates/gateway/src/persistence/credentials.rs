use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;

use common::params::{CredentialPath, EntityPath};

use super::Db;
use crate::error::Result;

#[derive(Debug, Clone, FromRow)]
pub struct CredentialRecord {
    pub path: String,
    pub cloud: String,
    pub owner: String,
    pub name: String,
    pub auth_type: String,
    #[sqlx(rename = "attributes_json")]
    pub attributes: Json<HashMap<String, String>>,
    #[sqlx(rename = "hidden_keys_json")]
    pub hidden_keys: Json<Vec<String>>,
    pub revoked: bool,
    pub valid: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    pub fn credential_path(&self) -> CredentialPath {
        CredentialPath::new(&self.cloud, &self.owner, &self.name)
    }

    pub fn is_secret(&self, key: &str) -> bool {
        self.hidden_keys.0.iter().any(|k| k == key)
    }
}

#[derive(Debug, Clone)]
pub struct NewCredential {
    pub path: CredentialPath,
    pub auth_type: String,
    pub attributes: HashMap<String, String>,
    pub hidden_keys: Vec<String>,
    pub revoked: bool,
}

const CREDENTIAL_COLUMNS: &str = r#"
    path,
    cloud,
    owner,
    name,
    auth_type,
    attributes_json,
    hidden_keys_json,
    revoked,
    valid,
    created_at,
    updated_at
"#;

/// Inserts or replaces the credential content. Changing a credential resets
/// its validity until the next successful push re-establishes it.
pub async fn set_cloud_credential(pool: &Db, new: &NewCredential) -> Result<CredentialRecord> {
    sqlx::query(
        r#"
        INSERT INTO cloud_credentials (path, cloud, owner, name, auth_type, attributes_json, hidden_keys_json, revoked)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT (path) DO UPDATE SET
            auth_type = excluded.auth_type,
            attributes_json = excluded.attributes_json,
            hidden_keys_json = excluded.hidden_keys_json,
            revoked = excluded.revoked,
            valid = NULL,
            updated_at = datetime('now')
        "#,
    )
    .bind(new.path.to_string())
    .bind(&new.path.cloud)
    .bind(&new.path.user)
    .bind(&new.path.name)
    .bind(&new.auth_type)
    .bind(Json(&new.attributes))
    .bind(Json(&new.hidden_keys))
    .bind(new.revoked)
    .execute(pool)
    .await?;

    get_credential(pool, &new.path)
        .await?
        .ok_or_else(|| crate::error::Error::internal("credential upsert did not return row"))
}

pub async fn get_credential(
    pool: &Db,
    path: &CredentialPath,
) -> Result<Option<CredentialRecord>> {
    let record = sqlx::query_as::<_, CredentialRecord>(&format!(
        "SELECT {CREDENTIAL_COLUMNS} FROM cloud_credentials WHERE path = ?1"
    ))
    .bind(path.to_string())
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// All credentials owned by `owner` for `cloud`, used when the caller did
/// not name one explicitly.
pub async fn credentials_for_owner_cloud(
    pool: &Db,
    owner: &str,
    cloud: &str,
) -> Result<Vec<CredentialRecord>> {
    let records = sqlx::query_as::<_, CredentialRecord>(&format!(
        "SELECT {CREDENTIAL_COLUMNS} FROM cloud_credentials WHERE owner = ?1 AND cloud = ?2 ORDER BY path ASC"
    ))
    .bind(owner)
    .bind(cloud)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn credentials_for_owner(pool: &Db, owner: &str) -> Result<Vec<CredentialRecord>> {
    let records = sqlx::query_as::<_, CredentialRecord>(&format!(
        "SELECT {CREDENTIAL_COLUMNS} FROM cloud_credentials WHERE owner = ?1 ORDER BY path ASC"
    ))
    .bind(owner)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn set_credential_valid(
    pool: &Db,
    path: &CredentialPath,
    valid: bool,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE cloud_credentials
        SET valid = ?2, updated_at = datetime('now')
        WHERE path = ?1
        "#,
    )
    .bind(path.to_string())
    .bind(valid)
    .execute(pool)
    .await?;
    Ok(())
}

/// Records that a credential has been pushed to a controller. Pushing twice
/// leaves a single row.
pub async fn credential_add_controller(
    pool: &Db,
    cred: &CredentialPath,
    controller: &EntityPath,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO credential_controllers (credential_path, controller_path)
        VALUES (?1, ?2)
        "#,
    )
    .bind(cred.to_string())
    .bind(controller.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// The controllers this credential has been pushed to.
pub async fn credential_controllers(pool: &Db, cred: &CredentialPath) -> Result<Vec<String>> {
    let paths: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT controller_path FROM credential_controllers
        WHERE credential_path = ?1
        ORDER BY controller_path ASC
        "#,
    )
    .bind(cred.to_string())
    .fetch_all(pool)
    .await?;
    Ok(paths)
}

/// Flags each named controller as holding a stale copy of the credential.
pub async fn set_credential_updates(
    pool: &Db,
    controllers: &[String],
    cred: &CredentialPath,
) -> Result<()> {
    let cred = cred.to_string();
    for controller in controllers {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO controller_credential_updates (controller_path, credential_path)
            VALUES (?1, ?2)
            "#,
        )
        .bind(controller)
        .bind(&cred)
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub async fn clear_credential_update(
    pool: &Db,
    controller: &EntityPath,
    cred: &CredentialPath,
) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM controller_credential_updates
        WHERE controller_path = ?1 AND credential_path = ?2
        "#,
    )
    .bind(controller.to_string())
    .bind(cred.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Credential paths still awaiting a push to the given controller.
pub async fn pending_credential_updates(
    pool: &Db,
    controller: &EntityPath,
) -> Result<Vec<String>> {
    let paths: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT credential_path FROM controller_credential_updates
        WHERE controller_path = ?1
        ORDER BY credential_path ASC
        "#,
    )
    .bind(controller.to_string())
    .fetch_all(pool)
    .await?;
    Ok(paths)
}
