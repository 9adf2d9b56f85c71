//! Cloud lifecycle: creation on a controller, listing and removal.

use std::collections::HashMap;

use tracing::{error, warn};

use common::api::{CloudInfo, CloudRegionInfo};
use common::params::EntityPath;

use crate::app_state::AppState;
use crate::auth::Identity;
use crate::authz;
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::persistence::{self as db, AuditEntry, CanReadIter};
use crate::services::controllers::select_random_controller;

/// Creates a cloud: record it in the index, place it on a randomly selected
/// controller, then mark that controller as the cloud's primary. The region
/// list must not name the cloud-level row; it is created implicitly.
pub async fn create_cloud(
    state: &AppState,
    ctx: &Context,
    identity: &Identity,
    name: &str,
    cloud: &CloudInfo,
) -> Result<()> {
    // Insert the cloud-level row first and fail early on a name collision.
    let cloud_row = db::NewCloudRegion {
        cloud: name.to_string(),
        region: String::new(),
        provider_type: cloud.provider_type.clone(),
        endpoint: cloud.endpoint.clone(),
        identity_endpoint: cloud.identity_endpoint.clone(),
        storage_endpoint: cloud.storage_endpoint.clone(),
        ca_certs: Vec::new(),
        auth_types: cloud.auth_types.clone(),
        primary_controllers: Vec::new(),
        secondary_controllers: Vec::new(),
        acl_read: vec![identity.username.clone()],
        acl_admin: vec![identity.username.clone()],
    };
    db::clouds::insert_cloud_region(&state.db, &cloud_row)
        .await
        .map_err(|err| {
            if err.code() == crate::error::ErrorCode::AlreadyExists {
                Error::already_exists(format!("cloud {name:?} already exists"))
            } else {
                err
            }
        })?;
    for region in &cloud.regions {
        let mut row = cloud_row.clone();
        row.region = region.name.clone();
        row.provider_type = String::new();
        row.endpoint = region.endpoint.clone();
        db::clouds::insert_cloud_region(&state.db, &row).await?;
    }

    let placed = place_cloud(state, ctx, identity, name, cloud).await;
    let ctl_path = match placed {
        Ok(path) => path,
        Err(err) => {
            if let Err(rerr) = db::clouds::remove_cloud(&state.db, name).await {
                warn!(cloud = name, %rerr, "cannot remove cloud that failed to deploy");
            }
            return Err(err);
        }
    };

    let mut regions: Vec<String> = cloud.regions.iter().map(|r| r.name.clone()).collect();
    regions.push(String::new());
    db::clouds::set_region_controllers(&state.db, name, &regions, &[ctl_path.clone()]).await?;

    if let Err(err) = db::audit::append_audit(
        &state.db,
        state.runtime.now(),
        &AuditEntry::CloudCreated {
            cloud: name.to_string(),
            controller_path: ctl_path.to_string(),
            creator: identity.username.clone(),
        },
    )
    .await
    {
        error!(%err, "cannot add audit log for cloud creation");
    }
    Ok(())
}

async fn place_cloud(
    state: &AppState,
    ctx: &Context,
    identity: &Identity,
    name: &str,
    cloud: &CloudInfo,
) -> Result<EntityPath> {
    let ctl = select_random_controller(state, identity).await?;
    let conn = state.open_api_from_record(ctx, &ctl).await?;
    conn.api().add_cloud(name, cloud).await?;
    Ok(ctl.entity_path())
}

/// Removes a cloud, so long as no models are using it.
pub async fn remove_cloud(
    state: &AppState,
    ctx: &Context,
    identity: &Identity,
    name: &str,
) -> Result<()> {
    let cloud_row = db::clouds::get_cloud_region(&state.db, name, "")
        .await?
        .ok_or_else(|| Error::not_found(format!("cloud {name:?} not found")))?;
    authz::check_acl(identity, &cloud_row.acl_admin.0)?;

    let in_use = db::models::count_for_cloud(&state.db, name).await?;
    if in_use > 0 {
        let plural = if in_use == 1 { "" } else { "s" };
        return Err(Error::bad_request(format!(
            "cloud is used by {in_use} model{plural}"
        )));
    }

    for ctl_path in &cloud_row.primary_controllers.0 {
        let ctl_path: EntityPath = ctl_path
            .parse()
            .map_err(|err: common::params::ParseError| Error::internal(err.to_string()))?;
        let conn = state.open_api(ctx, &ctl_path).await?;
        conn.api().remove_cloud(name).await.map_err(|err| {
            err.context(format!("cannot remove cloud from controller {ctl_path}"))
        })?;
    }

    db::clouds::remove_cloud(&state.db, name).await?;

    if let Err(err) = db::audit::append_audit(
        &state.db,
        state.runtime.now(),
        &AuditEntry::CloudRemoved {
            cloud: name.to_string(),
            initiator: identity.username.clone(),
        },
    )
    .await
    {
        error!(%err, "cannot add audit log for cloud removal");
    }
    Ok(())
}

/// Clouds the identity may read, grouped with their regions.
pub async fn readable_clouds(
    state: &AppState,
    identity: &Identity,
) -> Result<HashMap<String, CloudInfo>> {
    let all = db::clouds::list_cloud_regions(&state.db).await?;
    let readable = CanReadIter::new(identity, all).collect_all()?;

    let mut clouds: HashMap<String, CloudInfo> = HashMap::new();
    for row in &readable {
        if row.region.is_empty() {
            let entry = clouds.entry(row.cloud.clone()).or_default();
            entry.provider_type = row.provider_type.clone();
            entry.auth_types = row.auth_types.0.clone();
            entry.endpoint = row.endpoint.clone();
            entry.identity_endpoint = row.identity_endpoint.clone();
            entry.storage_endpoint = row.storage_endpoint.clone();
        }
    }
    for row in &readable {
        if !row.region.is_empty() {
            if let Some(entry) = clouds.get_mut(&row.cloud) {
                entry.regions.push(CloudRegionInfo {
                    name: row.region.clone(),
                    endpoint: row.endpoint.clone(),
                });
            }
        }
    }
    Ok(clouds)
}
