//! The Cloud facade: clouds, cloud credentials and their propagation.
//!
//! Versions 1 through 5 share one implementation; credential contents and
//! cloud management arrived at v2 and delegate is downward for everything
//! else.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use common::api::{
    CloudInfo, CloudsResult, CredentialContentResult, CredentialContentResults,
    CredentialContentsParams, Entities, ErrorResult, ErrorResults, RpcRequest,
    UpdateCredentialsParams, WireError,
};
use common::params::{
    cloud_credential_tag, cloud_tag, parse_cloud_credential_tag, parse_cloud_tag, parse_user_tag,
    CredentialPath,
};

use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::persistence::NewCredential;
use crate::rpc::dispatch::{decode, encode, method_not_found, Root};
use crate::services::{clouds, credentials};

/// Attribute names treated as secret when storing credentials. Stand-in for
/// per-provider credential schemas, which the gateway does not carry.
const SECRET_ATTRIBUTES: &[&str] = &[
    "password",
    "secret-key",
    "client-secret",
    "private-key",
    "token",
];

pub async fn dispatch(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    match (req.version, req.request.as_str()) {
        (_, "Clouds") => list_clouds(root).await,
        (_, "UserCredentials") => user_credentials(root, req).await,
        (_, "UpdateCredentials") => update_credentials(root, ctx, req).await,
        (_, "RevokeCredentials") => revoke_credentials(root, ctx, req).await,
        (2.., "CredentialContents") => credential_contents(root, req).await,
        (2.., "AddCloud") => add_cloud(root, ctx, req).await,
        (2.., "RemoveClouds") => remove_clouds(root, ctx, req).await,
        _ => Err(method_not_found(req)),
    }
}

async fn list_clouds(root: &Arc<Root>) -> Result<Value> {
    let identity = root.identity()?;
    let clouds = clouds::readable_clouds(&root.app, &identity).await?;
    let clouds: HashMap<String, CloudInfo> = clouds
        .into_iter()
        .map(|(name, info)| (cloud_tag(&name), info))
        .collect();
    encode(&CloudsResult { clouds })
}

#[derive(Debug, Deserialize)]
struct UserClouds {
    #[serde(rename = "user-clouds", default)]
    user_clouds: Vec<UserCloud>,
}

#[derive(Debug, Deserialize)]
struct UserCloud {
    #[serde(rename = "user-tag")]
    user_tag: String,
    #[serde(rename = "cloud-tag")]
    cloud_tag: String,
}

async fn user_credentials(root: &Arc<Root>, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let params: UserClouds = decode(&req.params)?;

    let mut results = Vec::with_capacity(params.user_clouds.len());
    for entry in params.user_clouds {
        let result = async {
            let user = parse_user_tag(&entry.user_tag)
                .map_err(|err| Error::bad_request(err.to_string()))?;
            root.app.authenticator.check_is_user(&identity, &user)?;
            let cloud = parse_cloud_tag(&entry.cloud_tag)
                .map_err(|err| Error::bad_request(err.to_string()))?;
            let creds = crate::persistence::credentials::credentials_for_owner_cloud(
                &root.app.db,
                &user,
                &cloud,
            )
            .await?;
            Ok::<_, Error>(
                creds
                    .iter()
                    .map(|c| cloud_credential_tag(&c.credential_path()))
                    .collect::<Vec<_>>(),
            )
        }
        .await;
        results.push(match result {
            Ok(tags) => serde_json::json!({ "result": tags }),
            Err(err) => serde_json::json!({
                "error": WireError::new(err.code(), err.to_string())
            }),
        });
    }
    Ok(serde_json::json!({ "results": results }))
}

async fn update_credentials(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let params: UpdateCredentialsParams = decode(&req.params)?;

    let mut results = Vec::with_capacity(params.credentials.len());
    for tagged in params.credentials {
        let result = async {
            let path = parse_cloud_credential_tag(&tagged.tag)
                .map_err(|err| Error::bad_request(err.to_string()))?;
            let hidden_keys = tagged
                .credential
                .attrs
                .keys()
                .filter(|k| SECRET_ATTRIBUTES.contains(&k.as_str()))
                .cloned()
                .collect();
            credentials::update_credential(
                &root.app,
                ctx,
                &identity,
                NewCredential {
                    path,
                    auth_type: tagged.credential.auth_type.clone(),
                    attributes: tagged.credential.attrs.clone(),
                    hidden_keys,
                    revoked: false,
                },
            )
            .await?;
            Ok::<_, Error>(())
        }
        .await;
        results.push(error_result(result));
    }
    encode(&ErrorResults { results })
}

async fn revoke_credentials(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let params: Entities = decode(&req.params)?;

    let mut results = Vec::with_capacity(params.entities.len());
    for entity in params.entities {
        let result = async {
            let path = parse_cloud_credential_tag(&entity.tag)
                .map_err(|err| Error::bad_request(err.to_string()))?;
            let cred = credentials::get_credential(&root.app, &identity, &path).await?;
            credentials::update_credential(
                &root.app,
                ctx,
                &identity,
                NewCredential {
                    path,
                    auth_type: cred.auth_type.clone(),
                    attributes: cred.attributes.0.clone(),
                    hidden_keys: cred.hidden_keys.0.clone(),
                    revoked: true,
                },
            )
            .await?;
            Ok::<_, Error>(())
        }
        .await;
        results.push(error_result(result));
    }
    encode(&ErrorResults { results })
}

async fn credential_contents(root: &Arc<Root>, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let params: CredentialContentsParams = decode(&req.params)?;

    let mut results = Vec::with_capacity(params.credentials.len());
    for id in params.credentials {
        let owner = if id.owner.is_empty() {
            identity.username.clone()
        } else {
            id.owner.clone()
        };
        let path = CredentialPath::new(&id.cloud, &owner, &id.name);
        let result = async {
            let cred = credentials::get_credential(&root.app, &identity, &path).await?;
            credentials::redacted_contents(&identity, &cred, params.include_secrets)
        }
        .await;
        results.push(match result {
            Ok(content) => CredentialContentResult {
                result: Some(content),
                error: None,
            },
            Err(err) => CredentialContentResult {
                result: None,
                error: Some(WireError::new(err.code(), err.to_string())),
            },
        });
    }
    encode(&CredentialContentResults { results })
}

#[derive(Debug, Deserialize)]
struct AddCloudParams {
    name: String,
    cloud: CloudInfo,
}

async fn add_cloud(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let params: AddCloudParams = decode(&req.params)?;
    clouds::create_cloud(&root.app, ctx, &identity, &params.name, &params.cloud).await?;
    Ok(Value::Object(Default::default()))
}

async fn remove_clouds(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let params: Entities = decode(&req.params)?;

    let mut results = Vec::with_capacity(params.entities.len());
    for entity in params.entities {
        let result = async {
            let name = parse_cloud_tag(&entity.tag)
                .map_err(|err| Error::bad_request(err.to_string()))?;
            clouds::remove_cloud(&root.app, ctx, &identity, &name).await
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
