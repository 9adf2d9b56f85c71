//! In-memory controller fakes for tests.
//!
//! The fake controller is scriptable: tests queue create outcomes, force
//! grant failures or model-info errors, and feed all-watcher events through
//! a channel.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use common::api::{CloudInfo, EntityStatus, Life, ModelCreateArgs, ModelInfo};
use common::params::ErrorCode;

use crate::error::{Error, Result};
use crate::upstream::{AllWatcher, ControllerApi, DialInfo, Dialer, MigrationTarget, WatchEvent};

/// A scripted error: code and message, cloneable for queues.
#[derive(Debug, Clone)]
pub struct ScriptedError {
    pub code: ErrorCode,
    pub message: String,
}

impl ScriptedError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn into_error(self) -> Error {
        Error::new(self.code, self.message)
    }
}

#[derive(Default)]
struct FakeState {
    version: Option<String>,
    models: HashMap<String, ModelInfo>,
    create_script: VecDeque<Option<ScriptedError>>,
    grant_script: VecDeque<Option<ScriptedError>>,
    model_info_errors: HashMap<String, ScriptedError>,
    credential_updates: Vec<(String, String, HashMap<String, String>)>,
    credential_revocations: Vec<String>,
    grants: Vec<(String, String, String)>,
    revokes: Vec<(String, String, String)>,
    destroys: Vec<(String, Option<bool>)>,
    migrations: Vec<(String, String)>,
    clouds: HashMap<String, CloudInfo>,
    removed_clouds: Vec<String>,
    watch_tx: Option<mpsc::UnboundedSender<Vec<WatchEvent>>>,
}

#[derive(Default)]
pub struct FakeControllerApi {
    state: Mutex<FakeState>,
}

impl FakeControllerApi {
    pub fn new(version: &str) -> Self {
        let fake = Self::default();
        fake.state.lock().expect("state").version = Some(version.to_string());
        fake
    }

    /// Queues the outcome of the next `create_model` call; `None` scripts a
    /// success.
    pub fn script_create(&self, outcome: Option<ScriptedError>) {
        self.state.lock().expect("state").create_script.push_back(outcome);
    }

    /// Queues the outcome of the next `grant_model` call.
    pub fn script_grant(&self, outcome: Option<ScriptedError>) {
        self.state.lock().expect("state").grant_script.push_back(outcome);
    }

    /// Makes `model_info(uuid)` fail with the given error.
    pub fn fail_model_info(&self, uuid: &str, err: ScriptedError) {
        self.state
            .lock()
            .expect("state")
            .model_info_errors
            .insert(uuid.to_string(), err);
    }

    pub fn insert_model(&self, info: ModelInfo) {
        self.state
            .lock()
            .expect("state")
            .models
            .insert(info.uuid.clone(), info);
    }

    /// Feeds a batch of events to the connected all-watcher.
    pub fn push_events(&self, events: Vec<WatchEvent>) {
        let state = self.state.lock().expect("state");
        if let Some(tx) = &state.watch_tx {
            let _ = tx.send(events);
        }
    }

    pub fn credential_updates(&self) -> Vec<(String, String, HashMap<String, String>)> {
        self.state.lock().expect("state").credential_updates.clone()
    }

    pub fn credential_revocations(&self) -> Vec<String> {
        self.state.lock().expect("state").credential_revocations.clone()
    }

    pub fn grants(&self) -> Vec<(String, String, String)> {
        self.state.lock().expect("state").grants.clone()
    }

    pub fn revokes(&self) -> Vec<(String, String, String)> {
        self.state.lock().expect("state").revokes.clone()
    }

    pub fn destroys(&self) -> Vec<(String, Option<bool>)> {
        self.state.lock().expect("state").destroys.clone()
    }

    pub fn migrations(&self) -> Vec<(String, String)> {
        self.state.lock().expect("state").migrations.clone()
    }

    pub fn created_models(&self) -> Vec<ModelInfo> {
        self.state.lock().expect("state").models.values().cloned().collect()
    }

    fn build_model(args: &ModelCreateArgs) -> ModelInfo {
        ModelInfo {
            name: args.name.clone(),
            uuid: Uuid::new_v4().to_string(),
            controller_uuid: Uuid::new_v4().to_string(),
            provider_type: "ec2".to_string(),
            default_series: "jammy".to_string(),
            cloud_tag: if args.cloud_tag.is_empty() {
                "cloud-aws".to_string()
            } else {
                args.cloud_tag.clone()
            },
            cloud_region: args.region.clone(),
            cloud_credential_tag: args.credential_tag.clone(),
            owner_tag: args.owner_tag.clone(),
            life: Life::Alive,
            status: EntityStatus {
                status: "available".to_string(),
                info: String::new(),
                since: None,
            },
            users: vec![],
            machines: vec![],
            agent_version: Some("2.9.33".to_string()),
            model_type: "iaas".to_string(),
        }
    }
}

#[async_trait]
impl ControllerApi for FakeControllerApi {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn controller_version(&self) -> Result<String> {
        let state = self.state.lock().expect("state");
        Ok(state.version.clone().unwrap_or_else(|| "2.9.33".to_string()))
    }

    async fn create_model(&self, args: &ModelCreateArgs) -> Result<ModelInfo> {
        let mut state = self.state.lock().expect("state");
        if let Some(Some(err)) = state.create_script.pop_front() {
            return Err(err.into_error());
        }
        let info = Self::build_model(args);
        state.models.insert(info.uuid.clone(), info.clone());
        Ok(info)
    }

    async fn model_info(&self, uuid: &str) -> Result<ModelInfo> {
        let state = self.state.lock().expect("state");
        if let Some(err) = state.model_info_errors.get(uuid) {
            return Err(err.clone().into_error());
        }
        state
            .models
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("model {uuid} not found")))
    }

    async fn destroy_model(&self, uuid: &str, destroy_storage: Option<bool>) -> Result<()> {
        let mut state = self.state.lock().expect("state");
        state.destroys.push((uuid.to_string(), destroy_storage));
        if let Some(model) = state.models.get_mut(uuid) {
            model.life = Life::Dying;
        }
        Ok(())
    }

    async fn grant_model(&self, user_tag: &str, access: &str, uuid: &str) -> Result<()> {
        let mut state = self.state.lock().expect("state");
        if let Some(Some(err)) = state.grant_script.pop_front() {
            return Err(err.into_error());
        }
        state
            .grants
            .push((user_tag.to_string(), access.to_string(), uuid.to_string()));
        Ok(())
    }

    async fn revoke_model(&self, user_tag: &str, access: &str, uuid: &str) -> Result<()> {
        let mut state = self.state.lock().expect("state");
        state
            .revokes
            .push((user_tag.to_string(), access.to_string(), uuid.to_string()));
        Ok(())
    }

    async fn update_credential(
        &self,
        tag: &str,
        auth_type: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("state");
        state.credential_updates.push((
            tag.to_string(),
            auth_type.to_string(),
            attributes.clone(),
        ));
        Ok(())
    }

    async fn revoke_credential(&self, tag: &str) -> Result<()> {
        let mut state = self.state.lock().expect("state");
        state.credential_revocations.push(tag.to_string());
        Ok(())
    }

    async fn add_cloud(&self, name: &str, cloud: &CloudInfo) -> Result<()> {
        let mut state = self.state.lock().expect("state");
        state.clouds.insert(name.to_string(), cloud.clone());
        Ok(())
    }

    async fn remove_cloud(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().expect("state");
        state.removed_clouds.push(name.to_string());
        Ok(())
    }

    async fn migrate_model(&self, uuid: &str, target: &MigrationTarget) -> Result<String> {
        let mut state = self.state.lock().expect("state");
        state
            .migrations
            .push((uuid.to_string(), target.controller_uuid.clone()));
        Ok(format!("migration-{uuid}"))
    }

    async fn watch_all(&self) -> Result<Box<dyn AllWatcher>> {
        let mut state = self.state.lock().expect("state");
        let (tx, rx) = mpsc::unbounded_channel();
        state.watch_tx = Some(tx);
        Ok(Box::new(FakeAllWatcher { rx }))
    }
}

struct FakeAllWatcher {
    rx: mpsc::UnboundedReceiver<Vec<WatchEvent>>,
}

#[async_trait]
impl AllWatcher for FakeAllWatcher {
    async fn next(&mut self) -> Result<Vec<WatchEvent>> {
        match self.rx.recv().await {
            Some(events) => Ok(events),
            None => Err(Error::api_connection("watcher stream closed")),
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}

/// An [`crate::app_state::AppState`] over an in-memory database and a
/// [`FakeDialer`], with deterministic candidate ordering and a frozen clock.
pub fn state_with_db(db: crate::persistence::Db) -> crate::app_state::AppState {
    state_with_db_and_dialer(db, Arc::new(FakeDialer::default())).0
}

pub fn state_with_db_and_dialer(
    db: crate::persistence::Db,
    dialer: Arc<FakeDialer>,
) -> (crate::app_state::AppState, Arc<crate::runtime::FrozenClock>) {
    let clock = Arc::new(crate::runtime::FrozenClock::new(chrono::Utc::now()));
    let runtime = crate::runtime::Runtime::deterministic(clock.clone());
    let checker = crate::auth::StaticCredentialChecker::new(HashMap::from([
        ("root".to_string(), "root-token".to_string()),
        ("alice".to_string(), "alice-token".to_string()),
        ("bob".to_string(), "bob-token".to_string()),
    ]));
    let authenticator = crate::auth::Authenticator::new("root".to_string(), Arc::new(checker))
        .expect("authenticator");
    let state = crate::app_state::AppState {
        db,
        conn_cache: Arc::new(crate::pool::ConnCache::new(
            std::time::Duration::from_secs(300),
            64,
            clock.clone(),
        )),
        dialer,
        runtime,
        authenticator,
        usage_client: None,
        controller_uuid: "6d4b9e2c-0000-4000-8000-000000000001".to_string(),
        server_version: "2.9.33".to_string(),
        monitor: crate::config::MonitorConfig::default(),
        heartbeat_idle_timeout: std::time::Duration::from_secs(90),
    };
    (state, clock)
}

/// Dialer backed by fakes, keyed by the first host of the dial info. Hosts
/// listed as unreachable fail with an `APIConnection` cause.
#[derive(Default)]
pub struct FakeDialer {
    controllers: Mutex<HashMap<String, Arc<FakeControllerApi>>>,
    unreachable: Mutex<Vec<String>>,
}

impl FakeDialer {
    pub fn register(&self, host: &str, api: Arc<FakeControllerApi>) {
        self.controllers
            .lock()
            .expect("controllers")
            .insert(host.to_string(), api);
    }

    pub fn set_unreachable(&self, host: &str) {
        self.unreachable
            .lock()
            .expect("unreachable")
            .push(host.to_string());
    }

    pub fn set_reachable(&self, host: &str) {
        self.unreachable
            .lock()
            .expect("unreachable")
            .retain(|h| h != host);
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, info: &DialInfo) -> Result<Arc<dyn ControllerApi>> {
        let host = info
            .hosts
            .first()
            .ok_or_else(|| Error::bad_request("controller has no hosts"))?;
        if self.unreachable.lock().expect("unreachable").contains(host) {
            return Err(Error::api_connection("cannot connect to API"));
        }
        let api = self
            .controllers
            .lock()
            .expect("controllers")
            .get(host)
            .cloned()
            .ok_or_else(|| Error::api_connection("cannot connect to API"))?;
        Ok(api)
    }
}
