//! The Controller facade, versions 3 through 9. The lower versions expose
//! the model listing and status surface; v9 adds model summary watcher
//! allocation.

use std::sync::Arc;

use serde_json::Value;

use common::api::{
    Entities, ModelAbstract, RpcRequest, SummaryWatcherId, UserModel, UserModelList,
};
use common::params::{model_tag, user_tag};

use crate::ctx::Context;
use crate::error::Result;
use crate::rpc::dispatch::{decode, encode, method_not_found, Root};
use crate::services::models;

pub async fn dispatch(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    match (req.version, req.request.as_str()) {
        (_, "AllModels") => all_models(root).await,
        (_, "ControllerConfig") => controller_config(),
        (_, "ModelStatus") => model_status(root, ctx, req).await,
        (9.., "WatchModelSummaries") | (9.., "WatchAllModelSummaries") => {
            watch_model_summaries(root).await
        }
        _ => Err(method_not_found(req)),
    }
}

async fn all_models(root: &Arc<Root>) -> Result<Value> {
    let identity = root.identity()?;
    let models = models::readable_models(&root.app, &identity).await?;
    let user_models = models
        .iter()
        .map(|m| UserModel {
            name: m.entity_path().name,
            uuid: m.uuid.clone(),
            model_type: m.model_type.clone().unwrap_or_default(),
            owner_tag: user_tag(&m.owner()),
        })
        .collect();
    encode(&UserModelList { user_models })
}

fn controller_config() -> Result<Value> {
    // The gateway has no controller-level configuration to expose.
    Ok(serde_json::json!({ "config": {} }))
}

async fn model_status(root: &Arc<Root>, _ctx: &Context, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let params: Entities = decode(&req.params)?;

    let mut results = Vec::with_capacity(params.entities.len());
    for entity in params.entities {
        let status = async {
            let model = models::get_model(
                &root.app,
                &identity,
                &entity.tag,
                models::ModelAuth::Read,
            )
            .await?;
            let machines =
                crate::persistence::inventory::machines_for_model(&root.app.db, &model.uuid)
                    .await?;
            Ok::<_, crate::error::Error>(serde_json::json!({
                "model-tag": model_tag(&model.uuid),
                "life": model.life,
                "type": model.model_type,
                "owner-tag": user_tag(&model.owner()),
                "hosted-machine-count": machines.len(),
            }))
        }
        .await;
        results.push(match status {
            Ok(status) => status,
            Err(err) => serde_json::json!({
                "error": common::api::WireError::new(err.code(), err.to_string())
            }),
        });
    }
    Ok(serde_json::json!({ "models": results }))
}

async fn watch_model_summaries(root: &Arc<Root>) -> Result<Value> {
    let identity = root.identity()?;
    let models = models::readable_models(&root.app, &identity).await?;
    let snapshot: Vec<ModelAbstract> = models
        .iter()
        .map(|m| ModelAbstract {
            uuid: m.uuid.clone(),
            name: m.entity_path().name,
            admins: m.acl_admin.0.clone(),
            cloud: m.cloud.clone(),
            region: m.cloud_region.clone(),
            status: m.status.clone().unwrap_or_default(),
        })
        .collect();
    let watcher_id = root.watchers.allocate(snapshot);
    encode(&SummaryWatcherId { watcher_id })
}
