//! The ModelSummaryWatcher facade: the only facade addressed through a
//! sub-object id.

use std::sync::Arc;

use serde_json::Value;

use common::api::{RpcRequest, SummaryWatcherNextResults};

use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::rpc::dispatch::{encode, method_not_found, Root};

pub async fn dispatch(root: &Arc<Root>, _ctx: &Context, req: &RpcRequest) -> Result<Value> {
    root.identity()?;
    if req.id.is_empty() {
        return Err(Error::bad_id("watcher id missing in request"));
    }
    match req.request.as_str() {
        "Next" => {
            let watcher = root.watchers.get(&req.id)?;
            let models = watcher.next().await?;
            encode(&SummaryWatcherNextResults { models })
        }
        "Stop" => {
            root.watchers.stop(&req.id)?;
            Ok(Value::Object(Default::default()))
        }
        _ => Err(method_not_found(req)),
    }
}
