//! Facade registry and request routing.
//!
//! A connection starts with the unauthenticated table (Admin and Pinger
//! only) and swaps to the immutable authenticated table on login. Requests
//! name `(facade, version, method)`; versions delegate downward inside each
//! facade module, so anything a version answers is answered by every later
//! version unless overridden.

use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;

use common::api::{FacadeVersions, RpcRequest, RpcResponse};

use crate::app_state::AppState;
use crate::auth::Identity;
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::heartbeat::HeartMonitor;
use crate::rpc::facades;
use crate::rpc::watchers::WatcherRegistry;

pub type FacadeTable = &'static [(&'static str, &'static [u16])];

pub static UNAUTHENTICATED_FACADES: FacadeTable = &[("Admin", &[3]), ("Pinger", &[1])];

pub static AUTHENTICATED_FACADES: FacadeTable = &[
    ("Admin", &[3]),
    ("Cloud", &[1, 2, 3, 4, 5]),
    ("Controller", &[3, 4, 5, 6, 7, 8, 9]),
    ("Gatehouse", &[1, 2]),
    ("ModelManager", &[2, 3, 4, 5]),
    ("ModelSummaryWatcher", &[1]),
    ("Pinger", &[1]),
    ("UserManager", &[1]),
];

/// Mutable per-connection state, guarded by a lock held only around
/// pointer-sized reads and writes.
pub struct ConnState {
    pub identity: Option<Identity>,
    pub facades: FacadeTable,
    pub mask_controller_uuid: bool,
}

/// The root object a connection dispatches against.
pub struct Root {
    pub app: AppState,
    pub heartbeat: Arc<HeartMonitor>,
    pub watchers: WatcherRegistry,
    conn: Mutex<ConnState>,
}

impl Root {
    pub fn new(app: AppState, heartbeat: Arc<HeartMonitor>) -> Self {
        Self {
            app,
            heartbeat,
            watchers: WatcherRegistry::new(),
            conn: Mutex::new(ConnState {
                identity: None,
                facades: UNAUTHENTICATED_FACADES,
                mask_controller_uuid: true,
            }),
        }
    }

    fn supported(&self, kind: &str, version: u16) -> bool {
        let table = self.conn.lock().expect("conn lock").facades;
        table
            .iter()
            .any(|(name, versions)| *name == kind && versions.contains(&version))
    }

    /// The authenticated identity, or `Unauthorized` before login.
    pub fn identity(&self) -> Result<Identity> {
        self.conn
            .lock()
            .expect("conn lock")
            .identity
            .clone()
            .ok_or_else(|| Error::unauthorized("not logged in"))
    }

    /// Transitions the connection into the authenticated state.
    pub fn set_authenticated(&self, identity: Identity) {
        let mut conn = self.conn.lock().expect("conn lock");
        conn.identity = Some(identity);
        conn.facades = AUTHENTICATED_FACADES;
    }

    pub fn mask_controller_uuid(&self) -> bool {
        self.conn.lock().expect("conn lock").mask_controller_uuid
    }

    pub fn set_mask_controller_uuid(&self, mask: bool) {
        self.conn.lock().expect("conn lock").mask_controller_uuid = mask;
    }

    /// The facade versions advertised in the login result.
    pub fn facade_versions(&self) -> Vec<FacadeVersions> {
        AUTHENTICATED_FACADES
            .iter()
            .map(|(name, versions)| FacadeVersions {
                name: name.to_string(),
                versions: versions.to_vec(),
            })
            .collect()
    }
}

/// Routes one request to its facade and wraps the outcome in a response
/// frame. Every dispatched call resets the connection heartbeat.
pub async fn dispatch(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> RpcResponse {
    root.heartbeat.heartbeat();
    metrics::counter!(
        "gateway_rpc_requests_total",
        "facade" => req.kind.clone(),
        "method" => req.request.clone(),
    )
    .increment(1);

    match route(root, ctx, req).await {
        Ok(value) => RpcResponse::result(req.request_id, value),
        Err(err) => RpcResponse::error(req.request_id, err.code(), err.to_string()),
    }
}

async fn route(root: &Arc<Root>, ctx: &Context, req: &RpcRequest) -> Result<Value> {
    if req.kind == "Admin" && req.version < 3 {
        return Err(Error::not_supported(
            "this server does not support login from old clients",
        ));
    }
    if !root.supported(&req.kind, req.version) {
        return Err(Error::not_implemented(format!(
            "unknown object type {:?} version {}",
            req.kind, req.version
        )));
    }
    // Sub-object ids are only meaningful for watcher facades.
    if !req.id.is_empty() && req.kind != "ModelSummaryWatcher" {
        return Err(Error::bad_id(format!(
            "unexpected id {:?} in request",
            req.id
        )));
    }

    match req.kind.as_str() {
        "Admin" => facades::admin::dispatch(root, ctx, req).await,
        "Pinger" => facades::pinger::dispatch(root, ctx, req).await,
        "Cloud" => facades::cloud::dispatch(root, ctx, req).await,
        "Controller" => facades::controller::dispatch(root, ctx, req).await,
        "Gatehouse" => facades::gatehouse::dispatch(root, ctx, req).await,
        "ModelManager" => facades::modelmanager::dispatch(root, ctx, req).await,
        "ModelSummaryWatcher" => facades::summarywatcher::dispatch(root, ctx, req).await,
        "UserManager" => facades::usermanager::dispatch(root, ctx, req).await,
        other => Err(Error::not_implemented(format!(
            "unknown object type {other:?}"
        ))),
    }
}

/// Decodes facade parameters; a shape mismatch is a dispatch error. A
/// request with no params is treated as an empty object.
pub fn decode<T: DeserializeOwned>(params: &Value) -> Result<T> {
    let value = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params.clone()
    };
    serde_json::from_value(value)
        .map_err(|err| Error::bad_request(format!("cannot unmarshal parameters: {err}")))
}

pub fn encode<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|err| Error::internal("cannot marshal response").with_cause(err))
}

/// The standard error for a method a facade version does not answer.
pub fn method_not_found(req: &RpcRequest) -> Error {
    Error::not_implemented(format!(
        "no such request - method {}({}).{} is not implemented",
        req.kind, req.version, req.request
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticated_versions_are_contiguous_and_monotonic() {
        for (name, versions) in AUTHENTICATED_FACADES {
            assert!(!versions.is_empty(), "{name} has no versions");
            for pair in versions.windows(2) {
                assert_eq!(
                    pair[1],
                    pair[0] + 1,
                    "{name} versions must be contiguous so later versions answer everything earlier ones do"
                );
            }
        }
    }

    #[test]
    fn unauthenticated_table_is_minimal() {
        let names: Vec<_> = UNAUTHENTICATED_FACADES.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["Admin", "Pinger"]);
    }
}
