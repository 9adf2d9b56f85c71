use std::sync::Arc;
use std::time::Duration;

use crate::auth::Authenticator;
use crate::config::MonitorConfig;
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::persistence::{self, Db};
use crate::pool::{ConnCache, ConnHandle};
use crate::runtime::Runtime;
use crate::upstream::{DialInfo, Dialer};
use crate::usage::UsageSenderAuthorizationClient;

/// Shared application state passed into facades, engines and the monitor.
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub conn_cache: Arc<ConnCache>,
    pub dialer: Arc<dyn Dialer>,
    pub runtime: Runtime,
    pub authenticator: Authenticator,
    pub usage_client: Option<Arc<dyn UsageSenderAuthorizationClient>>,
    /// UUID this gateway reports as "the controller" to clients.
    pub controller_uuid: String,
    pub server_version: String,
    pub monitor: MonitorConfig,
    pub heartbeat_idle_timeout: Duration,
}

impl AppState {
    /// Opens a pooled API connection to the controller at `path`, keyed by
    /// the controller UUID.
    pub async fn open_api(
        &self,
        ctx: &Context,
        path: &common::params::EntityPath,
    ) -> Result<ConnHandle> {
        let ctl = persistence::controllers::get_controller(&self.db, path)
            .await?
            .ok_or_else(|| Error::not_found(format!("controller {path} not found")))
            .map_err(|err| err.context("cannot get controller"))?;
        self.open_api_from_record(ctx, &ctl).await
    }

    /// Opens a connection to the controller held in the given record. Useful
    /// before the controller has been added to the index.
    pub async fn open_api_from_record(
        &self,
        ctx: &Context,
        ctl: &persistence::ControllerRecord,
    ) -> Result<ConnHandle> {
        let info = dial_info_for_controller(ctl);
        let dialer = self.dialer.clone();
        self.conn_cache
            .open_api(ctx, &ctl.uuid, move || async move {
                let api = dialer.dial(&info).await?;
                Ok((api, info))
            })
            .await
    }

    /// Opens a model-scoped connection, keyed by the model UUID.
    pub async fn open_model_api(
        &self,
        ctx: &Context,
        model: &persistence::ModelRecord,
    ) -> Result<ConnHandle> {
        let ctl_path = model.controller_entity_path();
        let ctl = persistence::controllers::get_controller(&self.db, &ctl_path)
            .await?
            .ok_or_else(|| Error::not_found(format!("controller {ctl_path} not found")))
            .map_err(|err| err.context("cannot get controller"))?;
        let mut info = dial_info_for_controller(&ctl);
        info.model_uuid = Some(model.uuid.clone());
        let dialer = self.dialer.clone();
        self.conn_cache
            .open_api(ctx, &model.uuid, move || async move {
                let api = dialer.dial(&info).await?;
                Ok((api, info))
            })
            .await
    }
}

pub fn dial_info_for_controller(ctl: &persistence::ControllerRecord) -> DialInfo {
    DialInfo {
        hosts: ctl.hosts.0.clone(),
        ca_cert: ctl.ca_cert.clone(),
        user: ctl.admin_user.clone(),
        password: ctl.admin_password.clone(),
        model_uuid: None,
    }
}
