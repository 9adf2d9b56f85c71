//! The upstream controller API.
//!
//! Controllers are external collaborators spoken to over their own REST API
//! with the configured admin credentials. The gateway sees them through the
//! [`ControllerApi`] trait so engines and the monitor never depend on the
//! transport; tests substitute an in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::api::{CloudInfo, ModelCreateArgs, ModelInfo, WireError};
use common::params::ErrorCode;

use crate::error::{Error, Result};

/// Everything needed to dial one controller (or one model on it).
#[derive(Debug, Clone)]
pub struct DialInfo {
    pub hosts: Vec<String>,
    pub ca_cert: Option<String>,
    pub user: String,
    pub password: String,
    /// Set for model-scoped connections.
    pub model_uuid: Option<String>,
}

/// One change observed on a controller's all-watcher stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WatchEvent {
    Model {
        uuid: String,
        life: String,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        status_message: Option<String>,
        #[serde(default)]
        agent_version: Option<String>,
    },
    ModelRemoved {
        uuid: String,
    },
    Machine {
        model_uuid: String,
        id: String,
        life: String,
        #[serde(default)]
        info: serde_json::Value,
    },
    MachineRemoved {
        model_uuid: String,
        id: String,
    },
    Application {
        model_uuid: String,
        name: String,
        life: String,
        #[serde(default)]
        info: serde_json::Value,
    },
    ApplicationRemoved {
        model_uuid: String,
        name: String,
    },
    ControllerVersion {
        version: String,
    },
}

/// A live all-watcher subscription. `next` blocks until the controller has
/// changes to deliver.
#[async_trait]
pub trait AllWatcher: Send {
    async fn next(&mut self) -> Result<Vec<WatchEvent>>;
    async fn stop(&mut self) -> Result<()>;
}

#[async_trait]
pub trait ControllerApi: Send + Sync {
    async fn ping(&self) -> Result<()>;
    async fn controller_version(&self) -> Result<String>;
    async fn create_model(&self, args: &ModelCreateArgs) -> Result<ModelInfo>;
    async fn model_info(&self, uuid: &str) -> Result<ModelInfo>;
    async fn destroy_model(&self, uuid: &str, destroy_storage: Option<bool>) -> Result<()>;
    async fn grant_model(&self, user_tag: &str, access: &str, uuid: &str) -> Result<()>;
    async fn revoke_model(&self, user_tag: &str, access: &str, uuid: &str) -> Result<()>;
    async fn update_credential(
        &self,
        tag: &str,
        auth_type: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<()>;
    async fn revoke_credential(&self, tag: &str) -> Result<()>;
    async fn add_cloud(&self, name: &str, cloud: &CloudInfo) -> Result<()>;
    async fn remove_cloud(&self, name: &str) -> Result<()>;
    /// Starts migrating a model to the named target controller, returning
    /// the upstream migration id.
    async fn migrate_model(&self, uuid: &str, target: &MigrationTarget) -> Result<String>;
    async fn watch_all(&self) -> Result<Box<dyn AllWatcher>>;
}

/// Connection details of the migration target, as the source controller
/// needs them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationTarget {
    #[serde(rename = "controller-uuid")]
    pub controller_uuid: String,
    pub hosts: Vec<String>,
    #[serde(rename = "ca-cert", default)]
    pub ca_cert: Option<String>,
    pub user: String,
    pub password: String,
}

/// Dials controllers. The pool invokes this through its single-flight path.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, info: &DialInfo) -> Result<Arc<dyn ControllerApi>>;
}

/// Production dialer: builds a REST client and probes it until the dial
/// timeout elapses.
pub struct RestDialer {
    pub timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for RestDialer {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            retry_delay: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl Dialer for RestDialer {
    async fn dial(&self, info: &DialInfo) -> Result<Arc<dyn ControllerApi>> {
        let client = RestControllerClient::new(info, self.timeout)?;
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut last_err;
        loop {
            match client.ping().await {
                Ok(()) => return Ok(Arc::new(client)),
                Err(err) => last_err = err,
            }
            if tokio::time::Instant::now() + self.retry_delay >= deadline {
                return Err(last_err.mask(ErrorCode::ApiConnection, "cannot connect to API"));
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}

/// REST client for one controller, authenticated as its admin user.
#[derive(Debug)]
pub struct RestControllerClient {
    base: String,
    user: String,
    password: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize, Deserialize)]
struct WatcherId {
    #[serde(rename = "watcher-id")]
    watcher_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WatchPage {
    #[serde(default)]
    events: Vec<WatchEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VersionInfo {
    version: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MigrationId {
    #[serde(rename = "migration-id")]
    migration_id: String,
}

impl RestControllerClient {
    pub fn new(info: &DialInfo, timeout: Duration) -> Result<Self> {
        let host = info
            .hosts
            .first()
            .ok_or_else(|| Error::bad_request("controller has no hosts"))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| Error::internal("cannot build HTTP client").with_cause(err))?;
        Ok(Self {
            base: format!("http://{host}"),
            user: info.user.clone(),
            password: info.password.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn check(&self, res: reqwest::Response) -> Result<reqwest::Response> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        if let Ok(wire) = serde_json::from_str::<WireError>(&body) {
            let code = wire
                .code
                .as_deref()
                .and_then(ErrorCode::from_wire)
                .unwrap_or(ErrorCode::Internal);
            return Err(Error::new(code, wire.message));
        }
        Err(Error::internal(format!(
            "controller request failed: {status}, body: {body}"
        )))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let res = self
            .client
            .get(self.url(path))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(request_error)?;
        let res = self.check(res).await?;
        res.json()
            .await
            .map_err(|err| Error::internal("cannot decode controller response").with_cause(err))
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let res = self
            .client
            .post(self.url(path))
            .basic_auth(&self.user, Some(&self.password))
            .json(body)
            .send()
            .await
            .map_err(request_error)?;
        let res = self.check(res).await?;
        res.json()
            .await
            .map_err(|err| Error::internal("cannot decode controller response").with_cause(err))
    }

    async fn post_unit<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let res = self
            .client
            .post(self.url(path))
            .basic_auth(&self.user, Some(&self.password))
            .json(body)
            .send()
            .await
            .map_err(request_error)?;
        self.check(res).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let res = self
            .client
            .delete(self.url(path))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(request_error)?;
        self.check(res).await?;
        Ok(())
    }
}

fn request_error(err: reqwest::Error) -> Error {
    Error::api_connection("controller request failed").with_cause(err)
}

#[async_trait]
impl ControllerApi for RestControllerClient {
    async fn ping(&self) -> Result<()> {
        let res = self
            .client
            .get(self.url("/api/ping"))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(request_error)?;
        self.check(res).await?;
        Ok(())
    }

    async fn controller_version(&self) -> Result<String> {
        let info: VersionInfo = self.get_json("/api/version").await?;
        Ok(info.version)
    }

    async fn create_model(&self, args: &ModelCreateArgs) -> Result<ModelInfo> {
        debug!(name = %args.name, owner = %args.owner_tag, "creating model on controller");
        self.post_json("/api/models", args).await
    }

    async fn model_info(&self, uuid: &str) -> Result<ModelInfo> {
        self.get_json(&format!("/api/models/{uuid}")).await
    }

    async fn destroy_model(&self, uuid: &str, destroy_storage: Option<bool>) -> Result<()> {
        let path = match destroy_storage {
            Some(flag) => format!("/api/models/{uuid}?destroy-storage={flag}"),
            None => format!("/api/models/{uuid}"),
        };
        self.delete(&path).await
    }

    async fn grant_model(&self, user_tag: &str, access: &str, uuid: &str) -> Result<()> {
        self.post_unit(
            &format!("/api/models/{uuid}/grant"),
            &serde_json::json!({"user-tag": user_tag, "access": access}),
        )
        .await
    }

    async fn revoke_model(&self, user_tag: &str, access: &str, uuid: &str) -> Result<()> {
        self.post_unit(
            &format!("/api/models/{uuid}/revoke"),
            &serde_json::json!({"user-tag": user_tag, "access": access}),
        )
        .await
    }

    async fn update_credential(
        &self,
        tag: &str,
        auth_type: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<()> {
        self.post_unit(
            &format!("/api/credentials/{tag}"),
            &serde_json::json!({"auth-type": auth_type, "attrs": attributes}),
        )
        .await
    }

    async fn revoke_credential(&self, tag: &str) -> Result<()> {
        self.delete(&format!("/api/credentials/{tag}")).await
    }

    async fn add_cloud(&self, name: &str, cloud: &CloudInfo) -> Result<()> {
        self.post_unit(
            &format!("/api/clouds/{name}"),
            cloud,
        )
        .await
    }

    async fn remove_cloud(&self, name: &str) -> Result<()> {
        self.delete(&format!("/api/clouds/{name}")).await
    }

    async fn migrate_model(&self, uuid: &str, target: &MigrationTarget) -> Result<String> {
        let id: MigrationId = self
            .post_json(&format!("/api/models/{uuid}/migrate"), target)
            .await?;
        Ok(id.migration_id)
    }

    async fn watch_all(&self) -> Result<Box<dyn AllWatcher>> {
        let id: WatcherId = self.post_json("/api/watch", &serde_json::json!({})).await?;
        Ok(Box::new(RestAllWatcher {
            client: RestControllerClient {
                base: self.base.clone(),
                user: self.user.clone(),
                password: self.password.clone(),
                client: self.client.clone(),
            },
            id: id.watcher_id,
            stopped: false,
        }))
    }
}

/// Long-poll all-watcher over the controller's REST API.
struct RestAllWatcher {
    client: RestControllerClient,
    id: String,
    stopped: bool,
}

#[async_trait]
impl AllWatcher for RestAllWatcher {
    async fn next(&mut self) -> Result<Vec<WatchEvent>> {
        if self.stopped {
            return Err(Error::bad_request("watcher has been stopped"));
        }
        let page: WatchPage = self
            .client
            .get_json(&format!("/api/watch/{}/next", self.id))
            .await?;
        Ok(page.events)
    }

    async fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.client.delete(&format!("/api/watch/{}", self.id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_event_serde_round_trips() {
        let event = WatchEvent::Model {
            uuid: "uuid-1".to_string(),
            life: "dying".to_string(),
            status: Some("busy".to_string()),
            status_message: None,
            agent_version: Some("2.9.33".to_string()),
        };
        let raw = serde_json::to_string(&event).expect("serialize");
        assert!(raw.contains("\"kind\":\"model\""));
        let back: WatchEvent = serde_json::from_str(&raw).expect("deserialize");
        match back {
            WatchEvent::Model { uuid, life, .. } => {
                assert_eq!(uuid, "uuid-1");
                assert_eq!(life, "dying");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn rest_client_requires_hosts() {
        let info = DialInfo {
            hosts: vec![],
            ca_cert: None,
            user: "admin".to_string(),
            password: "pw".to_string(),
            model_uuid: None,
        };
        let err = RestControllerClient::new(&info, Duration::from_secs(1)).expect_err("no hosts");
        assert_eq!(err.code(), crate::error::ErrorCode::BadRequest);
    }
}
