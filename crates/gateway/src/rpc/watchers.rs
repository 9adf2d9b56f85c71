//! Per-connection watcher registry.
//!
//! Model summary watchers are sub-objects: allocated by a Controller facade
//! call, addressed by id in subsequent `ModelSummaryWatcher` requests, and
//! torn down with the connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use common::api::ModelAbstract;

use crate::error::{Error, Result};

pub struct WatcherRegistry {
    watchers: Mutex<HashMap<String, Arc<SummaryWatcher>>>,
    next_id: AtomicU64,
}

pub struct SummaryWatcher {
    state: Mutex<WatcherState>,
    stopped: Notify,
}

impl std::fmt::Debug for SummaryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryWatcher").finish_non_exhaustive()
    }
}

struct WatcherState {
    snapshot: Option<Vec<ModelAbstract>>,
    stopped: bool,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self {
            watchers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self, snapshot: Vec<ModelAbstract>) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let watcher = Arc::new(SummaryWatcher {
            state: Mutex::new(WatcherState {
                snapshot: Some(snapshot),
                stopped: false,
            }),
            stopped: Notify::new(),
        });
        self.watchers
            .lock()
            .expect("watchers lock")
            .insert(id.clone(), watcher);
        id
    }

    pub fn get(&self, id: &str) -> Result<Arc<SummaryWatcher>> {
        self.watchers
            .lock()
            .expect("watchers lock")
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("watcher {id:?} not found")))
    }

    pub fn stop(&self, id: &str) -> Result<()> {
        let watcher = self
            .watchers
            .lock()
            .expect("watchers lock")
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("watcher {id:?} not found")))?;
        watcher.stop();
        Ok(())
    }

    /// Stops every watcher; called when the connection goes away.
    pub fn drain(&self) {
        let mut watchers = self.watchers.lock().expect("watchers lock");
        for (_, watcher) in watchers.drain() {
            watcher.stop();
        }
    }
}

impl Default for WatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SummaryWatcher {
    /// The first call yields the current summary page; later calls block
    /// until the watcher is stopped, which delivers a final empty page.
    pub async fn next(&self) -> Result<Vec<ModelAbstract>> {
        {
            let mut state = self.state.lock().expect("watcher lock");
            if state.stopped {
                return Err(Error::not_found("watcher has been stopped"));
            }
            if let Some(snapshot) = state.snapshot.take() {
                return Ok(snapshot);
            }
        }
        self.stopped.notified().await;
        Ok(Vec::new())
    }

    fn stop(&self) {
        self.state.lock().expect("watcher lock").stopped = true;
        self.stopped.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Vec<ModelAbstract> {
        vec![ModelAbstract {
            uuid: "uuid-1".to_string(),
            name: "m".to_string(),
            admins: vec!["alice".to_string()],
            cloud: "aws".to_string(),
            region: "eu-west-1".to_string(),
            status: "available".to_string(),
        }]
    }

    #[tokio::test]
    async fn first_next_returns_snapshot() {
        let registry = WatcherRegistry::new();
        let id = registry.allocate(page());
        let watcher = registry.get(&id).expect("get");
        let models = watcher.next().await.expect("next");
        assert_eq!(models.len(), 1);
    }

    #[tokio::test]
    async fn stop_releases_blocked_next() {
        let registry = WatcherRegistry::new();
        let id = registry.allocate(page());
        let watcher = registry.get(&id).expect("get");
        watcher.next().await.expect("snapshot");

        let blocked = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.next().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        registry.stop(&id).expect("stop");

        let page = blocked.await.expect("join").expect("next after stop");
        assert!(page.is_empty());
        assert!(registry.get(&id).is_err());
    }

    #[tokio::test]
    async fn unknown_watcher_is_not_found() {
        let registry = WatcherRegistry::new();
        let err = registry.get("42").expect_err("missing");
        assert_eq!(err.code(), crate::error::ErrorCode::NotFound);
    }
}
