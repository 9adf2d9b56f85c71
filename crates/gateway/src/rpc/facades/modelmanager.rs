//! The ModelManager facade: model listing, info, creation, destruction and
//! access control.
//!
//! v4 changed DestroyModels to carry a destroy-storage flag; everything
//! else delegates down the version chain.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use common::api::{
    AccessAction, DestroyModelsParams, Entities, ErrorResult, ErrorResults, ModelCreateArgs,
    ModelInfoResult, ModelInfoResults, ModifyModelAccessRequest, RpcRequest, UserModel,
    UserModelList, WireError,
};
use common::params::{parse_cloud_tag, parse_cloud_credential_tag, parse_user_tag, user_tag, EntityPath};

use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::rpc::dispatch::{decode, encode, method_not_found, Root};
use crate::services::models::{self, CreateModelParams};

pub async fn dispatch(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    match (req.version, req.request.as_str()) {
        (_, "ListModels") => list_models(root, req).await,
        (_, "ModelInfo") => model_info(root, ctx, req).await,
        (_, "CreateModel") => create_model(root, ctx, req).await,
        (4.., "DestroyModels") => destroy_models_v4(root, ctx, req).await,
        (_, "DestroyModels") => destroy_models_v2(root, ctx, req).await,
        (_, "ModifyModelAccess") => modify_model_access(root, ctx, req).await,
        _ => Err(method_not_found(req)),
    }
}

#[derive(Debug, Deserialize)]
struct ListModelsParams {
    #[serde(default)]
    tag: String,
}

async fn list_models(root: &Arc<Root>, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let params: ListModelsParams = decode(&req.params)?;
    if !params.tag.is_empty() {
        let user = parse_user_tag(&params.tag).map_err(|err| Error::bad_request(err.to_string()))?;
        root.app.authenticator.check_is_user(&identity, &user)?;
    }

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

async fn model_info(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let params: Entities = decode(&req.params)?;
    let mask = root.mask_controller_uuid();

    let mut results = Vec::with_capacity(params.entities.len());
    for entity in params.entities {
        let result = models::model_info(&root.app, ctx, &identity, &entity.tag, mask).await;
        results.push(match result {
            Ok(info) => ModelInfoResult {
                result: Some(info),
                error: None,
            },
            Err(err) => ModelInfoResult {
                result: None,
                error: Some(WireError::new(err.code(), err.to_string())),
            },
        });
    }
    encode(&ModelInfoResults { results })
}

async fn create_model(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let args: ModelCreateArgs = decode(&req.params)?;

    let owner = parse_user_tag(&args.owner_tag).map_err(|err| Error::bad_request(err.to_string()))?;
    let cloud = if args.cloud_tag.is_empty() {
        return Err(Error::bad_request("no cloud specified for model; please specify one"));
    } else {
        parse_cloud_tag(&args.cloud_tag).map_err(|err| Error::bad_request(err.to_string()))?
    };
    let credential = if args.credential_tag.is_empty() {
        None
    } else {
        Some(
            parse_cloud_credential_tag(&args.credential_tag)
                .map_err(|err| Error::bad_request(err.to_string()))?,
        )
    };

    let model = models::create_model(
        &root.app,
        ctx,
        &identity,
        CreateModelParams {
            path: EntityPath::new(owner, args.name.clone()),
            controller_path: None,
            credential,
            cloud,
            region: args.region.clone(),
            attributes: args.config.clone(),
        },
    )
    .await?;

    let info =
        models::model_info_from_index(&root.app, &identity, &model, root.mask_controller_uuid())
            .await?;
    encode(&info)
}

async fn destroy_models_v2(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let params: Entities = decode(&req.params)?;
    let mut results = Vec::with_capacity(params.entities.len());
    for entity in params.entities {
        results.push(error_result(
            models::destroy_model(&root.app, ctx, &identity, &entity.tag, None).await,
        ));
    }
    encode(&ErrorResults { results })
}

async fn destroy_models_v4(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let params: DestroyModelsParams = decode(&req.params)?;
    let mut results = Vec::with_capacity(params.models.len());
    for model in params.models {
        results.push(error_result(
            models::destroy_model(
                &root.app,
                ctx,
                &identity,
                &model.model_tag,
                model.destroy_storage,
            )
            .await,
        ));
    }
    encode(&ErrorResults { results })
}

async fn modify_model_access(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let params: ModifyModelAccessRequest = decode(&req.params)?;

    let mut results = Vec::with_capacity(params.changes.len());
    for change in params.changes {
        let result = async {
            let user = parse_user_tag(&change.user_tag)
                .map_err(|err| Error::bad_request(err.to_string()))?;
            match change.action {
                AccessAction::Grant => {
                    models::grant_model(
                        &root.app,
                        ctx,
                        &identity,
                        &change.model_tag,
                        &user,
                        &change.access,
                    )
                    .await
                }
                AccessAction::Revoke => {
                    models::revoke_model(
                        &root.app,
                        ctx,
                        &identity,
                        &change.model_tag,
                        &user,
                        &change.access,
                    )
                    .await
                }
            }
        }
        .await;
        results.push(error_result(result));
    }
    encode(&ErrorResults { results })
}

fn error_result(result: Result<()>) -> ErrorResult {
    ErrorResult {
        error: result
            .err()
            .map(|err| WireError::new(err.code(), err.to_string())),
    }
}
