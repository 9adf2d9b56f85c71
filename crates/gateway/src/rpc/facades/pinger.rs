use std::sync::Arc;

use serde_json::Value;

use common::api::RpcRequest;

use crate::ctx::Context;
use crate::error::Result;
use crate::rpc::dispatch::{method_not_found, Root};

pub async fn dispatch(_root: &Arc<Root>, _ctx: &Context, req: &RpcRequest) -> Result<Value> {
    match req.request.as_str() {
        // The dispatch path has already reset the heartbeat.
        "Ping" => Ok(Value::Object(Default::default())),
        _ => Err(method_not_found(req)),
    }
}
