//! The gateway's own facade: controller management, UUID masking, audit
//! access and model migration. v2 adds migration and audit queries.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use common::api::{
    AddControllerRequest, AuditLogAccessRequest, ControllerInfo, ControllerInfoList,
    MigrateModelRequest, MigrationEvent, MigrationEvents, RpcRequest,
};
use common::params::{parse_user_tag, EntityPath};

use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::persistence as db;
use crate::rpc::dispatch::{decode, encode, method_not_found, Root};
use crate::services::{controllers, models};

pub async fn dispatch(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    match (req.version, req.request.as_str()) {
        (_, "ListControllers") => list_controllers(root).await,
        (_, "AddController") => add_controller(root, ctx, req).await,
        (_, "RemoveController") => remove_controller(root, req).await,
        (_, "DisableControllerUUIDMasking") => disable_uuid_masking(root).await,
        (_, "GrantAuditLogAccess") => grant_audit_log_access(root, req).await,
        (2.., "MigrateModel") => migrate_model(root, ctx, req).await,
        (2.., "FindAuditEntries") => find_audit_entries(root, req).await,
        _ => Err(method_not_found(req)),
    }
}

fn controller_info(ctl: &db::ControllerRecord) -> ControllerInfo {
    ControllerInfo {
        path: ctl.path.clone(),
        uuid: ctl.uuid.clone(),
        public: ctl.public,
        deprecated: ctl.deprecated,
        agent_version: ctl.agent_version.clone(),
        unavailable_since: ctl.unavailable_since,
    }
}

async fn list_controllers(root: &Arc<Root>) -> Result<Value> {
    let identity = root.identity()?;
    root.app.authenticator.check_is_admin(&identity)?;
    let controllers = db::controllers::list_controllers(&root.app.db).await?;
    encode(&ControllerInfoList {
        controllers: controllers.iter().map(controller_info).collect(),
    })
}

async fn add_controller(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let params: AddControllerRequest = decode(&req.params)?;
    let record = controllers::add_controller(&root.app, ctx, &identity, params).await?;
    encode(&controller_info(&record))
}

#[derive(Debug, Deserialize)]
struct RemoveControllerParams {
    path: String,
}

async fn remove_controller(root: &Arc<Root>, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let params: RemoveControllerParams = decode(&req.params)?;
    let path: EntityPath = params
        .path
        .parse()
        .map_err(|err: common::params::ParseError| Error::bad_request(err.to_string()))?;
    controllers::delete_controller(&root.app, &identity, &path).await?;
    Ok(Value::Object(Default::default()))
}

async fn disable_uuid_masking(root: &Arc<Root>) -> Result<Value> {
    let identity = root.identity()?;
    root.app.authenticator.check_is_admin(&identity)?;
    root.set_mask_controller_uuid(false);
    Ok(Value::Object(Default::default()))
}

async fn grant_audit_log_access(root: &Arc<Root>, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    root.app.authenticator.check_is_admin(&identity)?;
    let params: AuditLogAccessRequest = decode(&req.params)?;
    let user =
        parse_user_tag(&params.user_tag).map_err(|err| Error::bad_request(err.to_string()))?;
    db::audit::grant_audit_log_access(&root.app.db, &user, &identity.username).await?;
    Ok(Value::Object(Default::default()))
}

async fn migrate_model(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let params: MigrateModelRequest = decode(&req.params)?;

    let mut events: Vec<MigrationEvent> = Vec::new();
    models::migrate_models(&root.app, ctx, &identity, &params.specs, &mut |event| {
        events.push(event)
    })
    .await?;
    encode(&MigrationEvents { events })
}

#[derive(Debug, Deserialize)]
struct FindAuditEntriesParams {
    #[serde(default = "default_audit_limit")]
    limit: u32,
}

fn default_audit_limit() -> u32 {
    50
}

async fn find_audit_entries(root: &Arc<Root>, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    if root.app.authenticator.check_is_admin(&identity).is_err()
        && !db::audit::has_audit_log_access(&root.app.db, &identity.username).await?
    {
        return Err(Error::unauthorized("unauthorized"));
    }
    let params: FindAuditEntriesParams = decode(&req.params)?;
    let records = db::audit::list_audit(&root.app.db, params.limit).await?;
    let entries: Vec<Value> = records
        .iter()
        .map(|r| {
            serde_json::json!({
                "type": r.entry_type,
                "time": r.created_at,
                "payload": serde_json::from_str::<Value>(&r.payload_json)
                    .unwrap_or(Value::Null),
            })
        })
        .collect();
    Ok(serde_json::json!({ "entries": entries }))
}
