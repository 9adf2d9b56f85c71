//! Controller monitoring.
//!
//! A lease field on each controller row ensures that across every gateway
//! replica at most one monitor reads a given controller's event stream. The
//! supervisor sweeps the controller list on an interval, acquires expired or
//! unheld leases by compare-and-swap, and runs one monitor task per lease it
//! wins. If a replica dies its leases lapse within the expiry duration and
//! another replica's sweep takes over.

mod controller;

use std::collections::HashSet;
use std::time::Duration;

use metrics::gauge;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use common::params::EntityPath;

use crate::app_state::AppState;
use crate::error::{ErrorCode, Result};
use crate::persistence::{self as db, LeaseOutcome};

/// The monitoring supervisor. Dropping the handle does not stop the
/// monitor; call [`Monitor::shutdown`].
pub struct Monitor {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Monitor {
    /// Starts monitoring with this replica's owner id.
    pub fn start(state: AppState, owner_id: String) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(state, owner_id, shutdown_rx));
        Self { shutdown_tx, task }
    }

    /// Broadcasts shutdown and waits for every controller monitor to
    /// acknowledge and release its lease.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.task.await {
            warn!(%err, "monitor task failed during shutdown");
        }
    }
}

async fn run(state: AppState, owner_id: String, shutdown: watch::Receiver<bool>) {
    loop {
        match all_monitor(&state, &owner_id, shutdown.clone()).await {
            Ok(()) => return,
            Err(err) => {
                // Inner failures never kill the supervisor; restart with a
                // fresh sweep after logging.
                warn!(%err, "restarting inner monitor after error");
            }
        }
        if *shutdown.borrow() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// One lifetime of the inner monitor: sweep leases, track running
/// controller monitors, exit cleanly on shutdown.
async fn all_monitor(
    state: &AppState,
    owner_id: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut monitoring: HashSet<String> = HashSet::new();
    let (removed_tx, mut removed_rx) = mpsc::channel::<EntityPath>(16);
    let sweep_interval = Duration::from_secs(state.monitor.lease_acquire_interval_secs);

    loop {
        start_monitors(state, owner_id, &mut monitoring, &removed_tx, &shutdown)
            .await
            .map_err(|err| err.context("cannot start monitors"))?;
        gauge!("gateway_monitor_controllers").set(monitoring.len() as f64);

        let sweep_timer = tokio::time::sleep(sweep_interval);
        tokio::pin!(sweep_timer);
        loop {
            tokio::select! {
                removed = removed_rx.recv() => {
                    if let Some(path) = removed {
                        monitoring.remove(&path.to_string());
                        gauge!("gateway_monitor_controllers").set(monitoring.len() as f64);
                    }
                }
                _ = &mut sweep_timer => break,
                _ = shutdown.changed() => {
                    if !*shutdown.borrow() {
                        continue;
                    }
                    // Wait for every controller monitor to report removal.
                    while !monitoring.is_empty() {
                        match removed_rx.recv().await {
                            Some(path) => {
                                monitoring.remove(&path.to_string());
                            }
                            None => break,
                        }
                    }
                    info!("monitor shut down");
                    return Ok(());
                }
            }
        }
    }
}

/// Starts a controller monitor for every controller whose lease this
/// replica can acquire.
async fn start_monitors(
    state: &AppState,
    owner_id: &str,
    monitoring: &mut HashSet<String>,
    removed_tx: &mpsc::Sender<EntityPath>,
    shutdown: &watch::Receiver<bool>,
) -> Result<()> {
    let controllers = db::controllers::list_controllers(&state.db)
        .await
        .map_err(|err| err.context("cannot get controllers"))?;
    let now = state.runtime.now();
    let expiry = now + chrono::Duration::seconds(state.monitor.lease_expiry_secs as i64);

    for ctl in controllers {
        if monitoring.contains(&ctl.path) {
            debug!(controller = %ctl.path, "already monitoring");
            continue;
        }
        let held_elsewhere = ctl.monitor_lease_owner.as_deref().is_some_and(|o| o != owner_id)
            && ctl.monitor_lease_expiry.is_some_and(|e| now < e);
        if held_elsewhere {
            continue;
        }

        let path = ctl.entity_path();
        let outcome = db::controllers::acquire_monitor_lease(
            &state.db,
            &path,
            ctl.monitor_lease_expiry,
            ctl.monitor_lease_owner.as_deref(),
            Some(owner_id),
            Some(expiry),
        )
        .await;
        match outcome {
            Ok(LeaseOutcome::Acquired) => {}
            Ok(LeaseOutcome::Mismatch { .. }) => {
                // Another replica got there first.
                continue;
            }
            Err(err) if err.code() == ErrorCode::MonitoringStopped => {
                info!(controller = %path, %err, "cannot acquire lease");
                continue;
            }
            Err(err) => return Err(err.context("cannot acquire lease")),
        }

        monitoring.insert(ctl.path.clone());
        let state = state.clone();
        let owner = owner_id.to_string();
        let removed_tx = removed_tx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result =
                controller::run(&state, &path, &owner, expiry, shutdown).await;
            match &result {
                Ok(()) => info!(controller = %path, "controller monitor stopped"),
                Err(err) => info!(controller = %path, %err, "controller monitor died"),
            }
            let _ = removed_tx.send(path).await;
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations::init_test_db;
    use crate::persistence::NewController;
    use crate::testing::{FakeControllerApi, FakeDialer};
    use crate::upstream::WatchEvent;
    use std::sync::Arc;

    async fn seed_controller(db: &db::Db, name: &str, host: &str) -> EntityPath {
        let path = EntityPath::new("admin", name);
        db::controllers::add_controller(
            db,
            NewController {
                path: path.clone(),
                uuid: uuid::Uuid::new_v4().to_string(),
                hosts: vec![host.to_string()],
                ca_cert: None,
                admin_user: "admin".to_string(),
                admin_password: "pw".to_string(),
                public: true,
            },
        )
        .await
        .expect("add controller");
        path
    }

    fn fast_state(
        db: db::Db,
        dialer: Arc<FakeDialer>,
    ) -> crate::app_state::AppState {
        let (mut state, _clock) = crate::testing::state_with_db_and_dialer(db, dialer);
        state.monitor.lease_acquire_interval_secs = 1;
        state.monitor.lease_expiry_secs = 60;
        state.monitor.api_connect_retry_secs = 1;
        state
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn sweep_acquires_lease_and_reconciles_events() {
        let db = init_test_db().await;
        let path = seed_controller(&db, "ctl", "ctl.example:17070").await;

        let api = Arc::new(FakeControllerApi::new("2.9.40"));
        let dialer = Arc::new(FakeDialer::default());
        dialer.register("ctl.example:17070", api.clone());
        let state = fast_state(db.clone(), dialer);

        // A model row the watcher events will update.
        db::models::add_model(
            &db,
            db::models::NewModel {
                path: EntityPath::new("alice", "m"),
                controller_path: Some(path.clone()),
                uuid: "uuid-1".to_string(),
                creator: "alice".to_string(),
                credential_path: None,
                usage_sender_credentials: None,
            },
        )
        .await
        .expect("add model");

        let monitor = Monitor::start(state.clone(), "replica-a".to_string());

        wait_for(|| async {
            db::controllers::get_controller(&db, &path)
                .await
                .expect("get")
                .expect("row")
                .monitor_lease_owner
                .as_deref()
                == Some("replica-a")
        })
        .await;

        // Agent version lands from the connection.
        wait_for(|| async {
            db::controllers::get_controller(&db, &path)
                .await
                .expect("get")
                .expect("row")
                .agent_version
                .as_deref()
                == Some("2.9.40")
        })
        .await;

        api.push_events(vec![WatchEvent::Model {
            uuid: "uuid-1".to_string(),
            life: "dying".to_string(),
            status: Some("destroying".to_string()),
            status_message: None,
            agent_version: None,
        }]);

        wait_for(|| async {
            db::models::model_from_uuid(&db, "uuid-1")
                .await
                .expect("get")
                .expect("row")
                .life
                == "dying"
        })
        .await;

        monitor.shutdown().await;

        // Shutdown released the lease.
        let ctl = db::controllers::get_controller(&db, &path)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(ctl.monitor_lease_owner, None);
        assert_eq!(ctl.monitor_lease_expiry, None);
    }

    #[tokio::test]
    async fn dying_model_is_reaped_on_removal_event() {
        let db = init_test_db().await;
        let path = seed_controller(&db, "ctl", "ctl.example:17070").await;
        let api = Arc::new(FakeControllerApi::new("2.9.40"));
        let dialer = Arc::new(FakeDialer::default());
        dialer.register("ctl.example:17070", api.clone());
        let state = fast_state(db.clone(), dialer);

        db::models::add_model(
            &db,
            db::models::NewModel {
                path: EntityPath::new("alice", "m"),
                controller_path: Some(path.clone()),
                uuid: "uuid-1".to_string(),
                creator: "alice".to_string(),
                credential_path: None,
                usage_sender_credentials: None,
            },
        )
        .await
        .expect("add model");
        db::models::set_model_life(&db, &path, "uuid-1", "dying")
            .await
            .expect("set life");

        let monitor = Monitor::start(state, "replica-a".to_string());
        wait_for(|| async {
            db::controllers::get_controller(&db, &path)
                .await
                .expect("get")
                .expect("row")
                .monitor_lease_owner
                .is_some()
        })
        .await;

        api.push_events(vec![WatchEvent::ModelRemoved {
            uuid: "uuid-1".to_string(),
        }]);

        wait_for(|| async {
            db::models::model_from_uuid(&db, "uuid-1")
                .await
                .expect("get")
                .is_none()
        })
        .await;
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn unexpired_foreign_lease_is_respected() {
        let db = init_test_db().await;
        let path = seed_controller(&db, "ctl", "ctl.example:17070").await;
        let api = Arc::new(FakeControllerApi::new("2.9.40"));
        let dialer = Arc::new(FakeDialer::default());
        dialer.register("ctl.example:17070", api.clone());
        let state = fast_state(db.clone(), dialer);

        // Replica A holds an unexpired lease.
        let expiry = state.runtime.now() + chrono::Duration::seconds(60);
        db::controllers::acquire_monitor_lease(
            &db,
            &path,
            None,
            None,
            Some("replica-a"),
            Some(expiry),
        )
        .await
        .expect("lease");

        let monitor = Monitor::start(state, "replica-b".to_string());
        tokio::time::sleep(Duration::from_millis(300)).await;

        let ctl = db::controllers::get_controller(&db, &path)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(ctl.monitor_lease_owner.as_deref(), Some("replica-a"));
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let db = init_test_db().await;
        let path = seed_controller(&db, "ctl", "ctl.example:17070").await;
        let api = Arc::new(FakeControllerApi::new("2.9.40"));
        let dialer = Arc::new(FakeDialer::default());
        dialer.register("ctl.example:17070", api.clone());
        let state = fast_state(db.clone(), dialer);

        // Replica A crashed; its lease has lapsed.
        let expiry = state.runtime.now() - chrono::Duration::seconds(5);
        db::controllers::acquire_monitor_lease(
            &db,
            &path,
            None,
            None,
            Some("replica-a"),
            Some(expiry),
        )
        .await
        .expect("lease");

        let monitor = Monitor::start(state, "replica-b".to_string());
        wait_for(|| async {
            db::controllers::get_controller(&db, &path)
                .await
                .expect("get")
                .expect("row")
                .monitor_lease_owner
                .as_deref()
                == Some("replica-b")
        })
        .await;
        monitor.shutdown().await;
    }
}
