//! The UserManager facade: information about the authenticated principal.
//! The gateway is not an identity provider, so only self-lookups answer.

use std::sync::Arc;

use serde_json::Value;

use common::api::{Entities, RpcRequest, UserInfo, UserInfoResult, UserInfoResults, WireError};
use common::params::parse_user_tag;

use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::rpc::dispatch::{decode, encode, method_not_found, Root};

pub async fn dispatch(root: &Arc<Root>, _ctx: &Context, req: &RpcRequest) -> Result<Value> {
    match req.request.as_str() {
        "UserInfo" => user_info(root, req).await,
        _ => Err(method_not_found(req)),
    }
}

async fn user_info(root: &Arc<Root>, req: &RpcRequest) -> Result<Value> {
    let identity = root.identity()?;
    let params: Entities = decode(&req.params)?;

    let mut results = Vec::with_capacity(params.entities.len());
    for entity in params.entities {
        let result = async {
            let user =
                parse_user_tag(&entity.tag).map_err(|err| Error::bad_request(err.to_string()))?;
            root.app.authenticator.check_is_user(&identity, &user)?;
            Ok::<_, Error>(UserInfo {
                username: user.clone(),
                display_name: user,
                access: if identity.admin {
                    "superuser".to_string()
                } else {
                    "login".to_string()
                },
                date_created: root.app.runtime.now(),
            })
        }
        .await;
        results.push(match result {
            Ok(info) => UserInfoResult {
                result: Some(info),
                error: None,
            },
            Err(err) => UserInfoResult {
                result: None,
                error: Some(WireError::new(err.code(), err.to_string())),
            },
        });
    }
    encode(&UserInfoResults { results })
}
