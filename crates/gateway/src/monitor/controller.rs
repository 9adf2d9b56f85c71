//! The per-controller monitor: one lease-holding task that follows the
//! controller's all-watcher stream and reconciles what it sees into the
//! index.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use common::params::EntityPath;

use crate::app_state::AppState;
use crate::ctx::Context;
use crate::error::{ErrorCode, Result};
use crate::persistence::{self as db, LeaseOutcome};
use crate::services::credentials::controller_update_credentials;
use crate::upstream::WatchEvent;

/// Runs until shutdown, the lease is lost, or the controller row is
/// removed. The lease is released on the way out.
pub(super) async fn run(
    state: &AppState,
    path: &EntityPath,
    owner_id: &str,
    mut lease_expiry: chrono::DateTime<chrono::Utc>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let result = monitor_loop(state, path, owner_id, &mut lease_expiry, &mut shutdown).await;
    release_lease(state, path, owner_id, lease_expiry).await;
    match result {
        Err(err) if err.code() == ErrorCode::MonitoringStopped => Ok(()),
        other => other,
    }
}

async fn monitor_loop(
    state: &AppState,
    path: &EntityPath,
    owner_id: &str,
    lease_expiry: &mut chrono::DateTime<chrono::Utc>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let ctx = Context::background();
    let retry = Duration::from_secs(state.monitor.api_connect_retry_secs.max(1));
    let mut connect_failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let conn = match state.open_api(&ctx, path).await {
            Ok(conn) => conn,
            Err(err) if err.code() == ErrorCode::NotFound => {
                return Err(err.mask(ErrorCode::MonitoringStopped, "controller has been removed"));
            }
            Err(err) => {
                connect_failures += 1;
                warn!(controller = %path, %err, attempts = connect_failures, "cannot connect to controller");
                if connect_failures >= 2 {
                    db::controllers::set_unavailable_at(&state.db, path, state.runtime.now())
                        .await?;
                }
                tokio::select! {
                    _ = tokio::time::sleep(retry) => continue,
                    _ = shutdown.changed() => continue,
                }
            }
        };
        match conn.api().controller_version().await {
            Ok(version) => {
                db::controllers::set_agent_version(&state.db, path, &version).await?;
            }
            Err(err) => debug!(controller = %path, %err, "cannot read controller version"),
        }

        // Drain credential pushes that failed or were missed while this
        // controller had no monitor.
        if let Err(err) = controller_update_credentials(state, &ctx, path).await {
            warn!(controller = %path, %err, "cannot update credentials");
        }

        let mut watcher = match conn.api().watch_all().await {
            Ok(watcher) => watcher,
            Err(err) => {
                // A cached connection can outlive the controller; failures
                // here count towards unavailability like dial failures do.
                connect_failures += 1;
                warn!(controller = %path, %err, "cannot start all-watcher");
                if connect_failures >= 2 {
                    db::controllers::set_unavailable_at(&state.db, path, state.runtime.now())
                        .await?;
                }
                tokio::select! {
                    _ = tokio::time::sleep(retry) => continue,
                    _ = shutdown.changed() => continue,
                }
            }
        };
        connect_failures = 0;
        db::controllers::clear_unavailable(&state.db, path).await?;

        // Follow the stream, renewing the lease before half of its life is
        // gone.
        loop {
            let renew_at = renewal_instant(state, *lease_expiry);
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = watcher.stop().await;
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(renew_at) => {
                    *lease_expiry = renew_lease(state, path, owner_id, *lease_expiry).await?;
                }
                events = watcher.next() => match events {
                    Ok(events) => {
                        for event in events {
                            if let Err(err) = apply_event(state, path, &event).await {
                                warn!(controller = %path, %err, "cannot apply watcher event");
                            }
                        }
                    }
                    Err(err) => {
                        warn!(controller = %path, %err, "all-watcher failed; reconnecting");
                        let _ = watcher.stop().await;
                        tokio::select! {
                            _ = tokio::time::sleep(retry) => {}
                            _ = shutdown.changed() => {}
                        }
                        break;
                    }
                }
            }
        }
    }
}

/// How long to sleep before renewing: half the remaining lease life.
fn renewal_instant(
    state: &AppState,
    expiry: chrono::DateTime<chrono::Utc>,
) -> Duration {
    let remaining = expiry - state.runtime.now();
    let half = remaining.num_milliseconds().max(0) as u64 / 2;
    Duration::from_millis(half.max(100))
}

async fn renew_lease(
    state: &AppState,
    path: &EntityPath,
    owner_id: &str,
    old_expiry: chrono::DateTime<chrono::Utc>,
) -> Result<chrono::DateTime<chrono::Utc>> {
    let new_expiry =
        state.runtime.now() + chrono::Duration::seconds(state.monitor.lease_expiry_secs as i64);
    let outcome = db::controllers::acquire_monitor_lease(
        &state.db,
        path,
        Some(old_expiry),
        Some(owner_id),
        Some(owner_id),
        Some(new_expiry),
    )
    .await?;
    match outcome {
        LeaseOutcome::Acquired => Ok(new_expiry),
        LeaseOutcome::Mismatch { owner, .. } => {
            info!(controller = %path, current_owner = ?owner, "lost monitor lease");
            Err(crate::error::Error::monitoring_stopped("lease lost"))
        }
    }
}

async fn release_lease(
    state: &AppState,
    path: &EntityPath,
    owner_id: &str,
    lease_expiry: chrono::DateTime<chrono::Utc>,
) {
    let outcome = db::controllers::acquire_monitor_lease(
        &state.db,
        path,
        Some(lease_expiry),
        Some(owner_id),
        None,
        None,
    )
    .await;
    match outcome {
        Ok(LeaseOutcome::Acquired) => {}
        Ok(LeaseOutcome::Mismatch { .. }) => {
            // Someone else already owns or cleared it; nothing to release.
        }
        Err(err) if err.code() == ErrorCode::MonitoringStopped => {}
        Err(err) => warn!(controller = %path, %err, "cannot release monitor lease"),
    }
}

/// Reconciles one observed change into the index. Events for models the
/// gateway does not track are ignored.
async fn apply_event(state: &AppState, path: &EntityPath, event: &WatchEvent) -> Result<()> {
    match event {
        WatchEvent::Model {
            uuid,
            life,
            status,
            status_message,
            agent_version,
        } => {
            db::models::update_model_info(
                &state.db,
                path,
                uuid,
                life,
                status.as_deref(),
                status_message.as_deref(),
                agent_version.as_deref(),
            )
            .await
        }
        WatchEvent::ModelRemoved { uuid } => {
            db::models::delete_model_with_uuid(&state.db, path, uuid).await
        }
        WatchEvent::Machine {
            model_uuid,
            id,
            life,
            info,
        } => {
            let Some(model) = db::models::model_from_uuid(&state.db, model_uuid).await? else {
                // Not one of ours.
                return Ok(());
            };
            if life == "dead" {
                return db::inventory::remove_machine(&state.db, path, model_uuid, id).await;
            }
            db::inventory::update_machine_info(
                &state.db,
                path,
                model_uuid,
                id,
                &model.cloud,
                &model.cloud_region,
                info,
            )
            .await
        }
        WatchEvent::MachineRemoved { model_uuid, id } => {
            db::inventory::remove_machine(&state.db, path, model_uuid, id).await
        }
        WatchEvent::Application {
            model_uuid,
            name,
            life,
            info,
        } => {
            let Some(model) = db::models::model_from_uuid(&state.db, model_uuid).await? else {
                return Ok(());
            };
            if life == "dead" {
                return db::inventory::remove_application(&state.db, path, model_uuid, name).await;
            }
            db::inventory::update_application_info(
                &state.db,
                path,
                model_uuid,
                name,
                &model.cloud,
                &model.cloud_region,
                info,
            )
            .await
        }
        WatchEvent::ApplicationRemoved { model_uuid, name } => {
            db::inventory::remove_application(&state.db, path, model_uuid, name).await
        }
        WatchEvent::ControllerVersion { version } => {
            db::controllers::set_agent_version(&state.db, path, version).await
        }
    }
}
