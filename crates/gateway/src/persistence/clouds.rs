use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;

use common::params::EntityPath;

use super::{insert_error, Db};
use crate::error::{Error, Result};

/// One region of a cloud. Every cloud also has a row with the empty region
/// name representing the cloud itself; that row carries the provider type
/// and auth types.
#[derive(Debug, Clone, FromRow)]
pub struct CloudRegionRecord {
    pub cloud: String,
    pub region: String,
    pub provider_type: String,
    pub endpoint: String,
    pub identity_endpoint: String,
    pub storage_endpoint: String,
    #[sqlx(rename = "ca_certs_json")]
    pub ca_certs: Json<Vec<String>>,
    #[sqlx(rename = "auth_types_json")]
    pub auth_types: Json<Vec<String>>,
    #[sqlx(rename = "primary_controllers_json")]
    pub primary_controllers: Json<Vec<String>>,
    #[sqlx(rename = "secondary_controllers_json")]
    pub secondary_controllers: Json<Vec<String>>,
    #[sqlx(rename = "acl_read_json")]
    pub acl_read: Json<Vec<String>>,
    #[sqlx(rename = "acl_write_json")]
    pub acl_write: Json<Vec<String>>,
    #[sqlx(rename = "acl_admin_json")]
    pub acl_admin: Json<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewCloudRegion {
    pub cloud: String,
    pub region: String,
    pub provider_type: String,
    pub endpoint: String,
    pub identity_endpoint: String,
    pub storage_endpoint: String,
    pub ca_certs: Vec<String>,
    pub auth_types: Vec<String>,
    pub primary_controllers: Vec<String>,
    pub secondary_controllers: Vec<String>,
    pub acl_read: Vec<String>,
    pub acl_admin: Vec<String>,
}

const REGION_COLUMNS: &str = r#"
    cloud,
    region,
    provider_type,
    endpoint,
    identity_endpoint,
    storage_endpoint,
    ca_certs_json,
    auth_types_json,
    primary_controllers_json,
    secondary_controllers_json,
    acl_read_json,
    acl_write_json,
    acl_admin_json,
    created_at,
    updated_at
"#;

pub async fn insert_cloud_region(pool: &Db, new: &NewCloudRegion) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cloud_regions (
            cloud, region, provider_type, endpoint, identity_endpoint, storage_endpoint,
            ca_certs_json, auth_types_json, primary_controllers_json,
            secondary_controllers_json, acl_read_json, acl_admin_json
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
    )
    .bind(&new.cloud)
    .bind(&new.region)
    .bind(&new.provider_type)
    .bind(&new.endpoint)
    .bind(&new.identity_endpoint)
    .bind(&new.storage_endpoint)
    .bind(Json(&new.ca_certs))
    .bind(Json(&new.auth_types))
    .bind(Json(&new.primary_controllers))
    .bind(Json(&new.secondary_controllers))
    .bind(Json(&new.acl_read))
    .bind(Json(&new.acl_admin))
    .execute(pool)
    .await
    .map_err(|err| insert_error(err, &format!("cloud {:?}", new.cloud)))?;
    Ok(())
}

pub async fn get_cloud_region(
    pool: &Db,
    cloud: &str,
    region: &str,
) -> Result<Option<CloudRegionRecord>> {
    let record = sqlx::query_as::<_, CloudRegionRecord>(&format!(
        "SELECT {REGION_COLUMNS} FROM cloud_regions WHERE cloud = ?1 AND region = ?2"
    ))
    .bind(cloud)
    .bind(region)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn regions_for_cloud(pool: &Db, cloud: &str) -> Result<Vec<CloudRegionRecord>> {
    let records = sqlx::query_as::<_, CloudRegionRecord>(&format!(
        "SELECT {REGION_COLUMNS} FROM cloud_regions WHERE cloud = ?1 ORDER BY region ASC"
    ))
    .bind(cloud)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn list_cloud_regions(pool: &Db) -> Result<Vec<CloudRegionRecord>> {
    let records = sqlx::query_as::<_, CloudRegionRecord>(&format!(
        "SELECT {REGION_COLUMNS} FROM cloud_regions ORDER BY cloud ASC, region ASC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Records the controllers serving a set of regions, used after a cloud has
/// been placed on its first controller.
pub async fn set_region_controllers(
    pool: &Db,
    cloud: &str,
    regions: &[String],
    primary: &[EntityPath],
) -> Result<()> {
    let primary: Vec<String> = primary.iter().map(|p| p.to_string()).collect();
    for region in regions {
        sqlx::query(
            r#"
            UPDATE cloud_regions
            SET primary_controllers_json = ?3, updated_at = datetime('now')
            WHERE cloud = ?1 AND region = ?2
            "#,
        )
        .bind(cloud)
        .bind(region)
        .bind(Json(&primary))
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub async fn remove_cloud(pool: &Db, cloud: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM cloud_regions WHERE cloud = ?1")
        .bind(cloud)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("cloud {cloud:?} not found")));
    }
    Ok(())
}

/// The provider type of a cloud, taken from its cloud-level region row.
pub async fn provider_type(pool: &Db, cloud: &str) -> Result<String> {
    let record = get_cloud_region(pool, cloud, "").await?;
    match record {
        Some(region) => Ok(region.provider_type),
        None => Err(Error::not_found(format!("cloud {cloud:?} not found"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations::init_test_db;

    fn cloud_row(cloud: &str, region: &str) -> NewCloudRegion {
        NewCloudRegion {
            cloud: cloud.to_string(),
            region: region.to_string(),
            provider_type: if region.is_empty() {
                "ec2".to_string()
            } else {
                String::new()
            },
            auth_types: vec!["userpass".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn cloud_level_row_carries_provider_type() {
        let db = init_test_db().await;
        insert_cloud_region(&db, &cloud_row("aws", "")).await.expect("cloud row");
        insert_cloud_region(&db, &cloud_row("aws", "eu-west-1")).await.expect("region row");

        assert_eq!(provider_type(&db, "aws").await.expect("provider"), "ec2");
        let regions = regions_for_cloud(&db, "aws").await.expect("regions");
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].region, "");
    }

    #[tokio::test]
    async fn duplicate_cloud_is_already_exists() {
        let db = init_test_db().await;
        insert_cloud_region(&db, &cloud_row("aws", "")).await.expect("insert");
        let err = insert_cloud_region(&db, &cloud_row("aws", ""))
            .await
            .expect_err("duplicate");
        assert_eq!(err.code(), crate::error::ErrorCode::AlreadyExists);
    }

    #[tokio::test]
    async fn set_region_controllers_updates_only_named_regions() {
        let db = init_test_db().await;
        insert_cloud_region(&db, &cloud_row("aws", "")).await.expect("insert");
        insert_cloud_region(&db, &cloud_row("aws", "us-east-1")).await.expect("insert");

        set_region_controllers(
            &db,
            "aws",
            &[String::new()],
            &[EntityPath::new("admin", "ctl")],
        )
        .await
        .expect("set");

        let cloud = get_cloud_region(&db, "aws", "").await.expect("get").expect("row");
        assert_eq!(cloud.primary_controllers.0, vec!["admin/ctl".to_string()]);
        let region = get_cloud_region(&db, "aws", "us-east-1")
            .await
            .expect("get")
            .expect("row");
        assert!(region.primary_controllers.0.is_empty());
    }
}
