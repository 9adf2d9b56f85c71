//! The Admin facade: the login handshake.

use std::sync::Arc;

use serde_json::Value;

use common::api::{AuthUserInfo, LoginRequest, LoginResult, RpcRequest};

use crate::ctx::Context;
use crate::error::Result;
use crate::rpc::dispatch::{decode, encode, method_not_found, Root};
use crate::services::controllers::earliest_controller_version;

pub async fn dispatch(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    match req.request.as_str() {
        "Login" => login(root, ctx, req).await,
        _ => Err(method_not_found(req)),
    }
}

async fn login(root: &Arc<Root>, _ctx: &Context, req: &RpcRequest) -> Result<Value> {
    let params: LoginRequest = decode(&req.params)?;
    let identity = root
        .app
        .authenticator
        .login(&params.auth_tag, &params.credentials)?;
    root.set_authenticated(identity.clone());

    // Report the oldest agent version in the fleet so clients negotiate
    // features every controller can honour.
    let server_version = match earliest_controller_version(&root.app, &identity).await? {
        Some(version) => version.to_string(),
        None => root.app.server_version.clone(),
    };

    let result = LoginResult {
        user_info: AuthUserInfo {
            identity: identity.tag(),
            controller_access: if identity.admin {
                "superuser".to_string()
            } else {
                "login".to_string()
            },
        },
        controller_tag: format!("controller-{}", root.app.controller_uuid),
        server_version,
        facades: root.facade_versions(),
    };
    encode(&result)
}
