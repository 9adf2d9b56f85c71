use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;

use common::params::EntityPath;

use super::Db;
use crate::error::Result;

/// Machine state reconciled from a controller's all-watcher stream.
#[derive(Debug, Clone, FromRow)]
pub struct MachineRecord {
    pub controller_path: String,
    pub model_uuid: String,
    pub machine_id: String,
    pub cloud: String,
    pub region: String,
    #[sqlx(rename = "info_json")]
    pub info: Json<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ApplicationRecord {
    pub controller_path: String,
    pub model_uuid: String,
    pub name: String,
    pub cloud: String,
    pub region: String,
    #[sqlx(rename = "info_json")]
    pub info: Json<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

pub async fn update_machine_info(
    pool: &Db,
    controller: &EntityPath,
    model_uuid: &str,
    machine_id: &str,
    cloud: &str,
    region: &str,
    info: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO machines (controller_path, model_uuid, machine_id, cloud, region, info_json, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
        ON CONFLICT (controller_path, model_uuid, machine_id) DO UPDATE SET
            cloud = excluded.cloud,
            region = excluded.region,
            info_json = excluded.info_json,
            updated_at = datetime('now')
        "#,
    )
    .bind(controller.to_string())
    .bind(model_uuid)
    .bind(machine_id)
    .bind(cloud)
    .bind(region)
    .bind(Json(info))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn remove_machine(
    pool: &Db,
    controller: &EntityPath,
    model_uuid: &str,
    machine_id: &str,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM machines WHERE controller_path = ?1 AND model_uuid = ?2 AND machine_id = ?3",
    )
    .bind(controller.to_string())
    .bind(model_uuid)
    .bind(machine_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn machines_for_model(pool: &Db, model_uuid: &str) -> Result<Vec<MachineRecord>> {
    let records = sqlx::query_as::<_, MachineRecord>(
        r#"
        SELECT controller_path, model_uuid, machine_id, cloud, region, info_json, updated_at
        FROM machines
        WHERE model_uuid = ?1
        ORDER BY machine_id ASC
        "#,
    )
    .bind(model_uuid)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn update_application_info(
    pool: &Db,
    controller: &EntityPath,
    model_uuid: &str,
    name: &str,
    cloud: &str,
    region: &str,
    info: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO applications (controller_path, model_uuid, name, cloud, region, info_json, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
        ON CONFLICT (controller_path, model_uuid, name) DO UPDATE SET
            cloud = excluded.cloud,
            region = excluded.region,
            info_json = excluded.info_json,
            updated_at = datetime('now')
        "#,
    )
    .bind(controller.to_string())
    .bind(model_uuid)
    .bind(name)
    .bind(cloud)
    .bind(region)
    .bind(Json(info))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn remove_application(
    pool: &Db,
    controller: &EntityPath,
    model_uuid: &str,
    name: &str,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM applications WHERE controller_path = ?1 AND model_uuid = ?2 AND name = ?3",
    )
    .bind(controller.to_string())
    .bind(model_uuid)
    .bind(name)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn applications_for_model(
    pool: &Db,
    model_uuid: &str,
) -> Result<Vec<ApplicationRecord>> {
    let records = sqlx::query_as::<_, ApplicationRecord>(
        r#"
        SELECT controller_path, model_uuid, name, cloud, region, info_json, updated_at
        FROM applications
        WHERE model_uuid = ?1
        ORDER BY name ASC
        "#,
    )
    .bind(model_uuid)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations::init_test_db;
    use serde_json::json;

    #[tokio::test]
    async fn machine_upsert_replaces_info() {
        let db = init_test_db().await;
        let ctl = EntityPath::new("admin", "ctl");

        update_machine_info(&db, &ctl, "uuid-1", "0", "aws", "eu-west-1", &json!({"life": "alive"}))
            .await
            .expect("insert");
        update_machine_info(&db, &ctl, "uuid-1", "0", "aws", "eu-west-1", &json!({"life": "dying"}))
            .await
            .expect("update");

        let machines = machines_for_model(&db, "uuid-1").await.expect("list");
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].info.0["life"], "dying");

        remove_machine(&db, &ctl, "uuid-1", "0").await.expect("remove");
        assert!(machines_for_model(&db, "uuid-1").await.expect("list").is_empty());
    }
}
