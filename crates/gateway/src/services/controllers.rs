//! Controller registry operations.

use semver::Version;
use tracing::{debug, info};

use common::api::AddControllerRequest;
use common::params::EntityPath;

use crate::app_state::AppState;
use crate::auth::Identity;
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::persistence::{self as db, CanReadIter, ControllerRecord};

/// Registers a new controller. Only the configured controller admin may do
/// this; the controller must be dialable with the supplied credentials.
pub async fn add_controller(
    state: &AppState,
    ctx: &Context,
    identity: &Identity,
    req: AddControllerRequest,
) -> Result<ControllerRecord> {
    state.authenticator.check_is_admin(identity)?;

    let path: EntityPath = req
        .path
        .parse()
        .map_err(|err: common::params::ParseError| Error::bad_request(err.to_string()))?;
    if req.hosts.is_empty() {
        return Err(Error::bad_request("controller has no hosts"));
    }

    let candidate = ControllerRecord {
        path: path.to_string(),
        uuid: uuid::Uuid::new_v4().to_string(),
        hosts: sqlx::types::Json(req.hosts.clone()),
        ca_cert: if req.ca_cert.is_empty() {
            None
        } else {
            Some(req.ca_cert.clone())
        },
        admin_user: req.admin_user.clone(),
        admin_password: req.admin_password.clone(),
        public: req.public,
        deprecated: false,
        agent_version: None,
        unavailable_since: None,
        monitor_lease_owner: None,
        monitor_lease_expiry: None,
        created_at: state.runtime.now(),
        updated_at: state.runtime.now(),
    };

    // Prove the controller is reachable before recording it.
    let conn = state
        .open_api_from_record(ctx, &candidate)
        .await
        .map_err(|err| err.context("cannot connect to controller"))?;
    let version = conn.api().controller_version().await?;

    let record = db::controllers::add_controller(
        &state.db,
        db::NewController {
            path: path.clone(),
            uuid: candidate.uuid.clone(),
            hosts: req.hosts,
            ca_cert: candidate.ca_cert.clone(),
            admin_user: req.admin_user,
            admin_password: req.admin_password,
            public: req.public,
        },
    )
    .await?;
    db::controllers::set_agent_version(&state.db, &path, &version).await?;

    info!(controller = %path, %version, "controller added");
    Ok(db::controllers::get_controller(&state.db, &path)
        .await?
        .unwrap_or(record))
}

/// Removes a controller. Refuses while models still reference it.
pub async fn delete_controller(
    state: &AppState,
    identity: &Identity,
    path: &EntityPath,
) -> Result<()> {
    state.authenticator.check_is_admin(identity)?;
    db::controllers::delete_controller(&state.db, path).await
}

/// Public, available controllers the identity may read, in path order.
pub async fn readable_available_controllers(
    state: &AppState,
    identity: &Identity,
) -> Result<Vec<ControllerRecord>> {
    let all = db::controllers::list_controllers(&state.db).await?;
    let candidates = all
        .into_iter()
        .filter(|c| c.public && c.available())
        .collect::<Vec<_>>();
    CanReadIter::new(identity, candidates).collect_all()
}

/// The earliest agent version any available public controller is known to
/// run; `None` when no controller reports a version.
pub async fn earliest_controller_version(
    state: &AppState,
    identity: &Identity,
) -> Result<Option<Version>> {
    let mut earliest: Option<Version> = None;
    for ctl in readable_available_controllers(state, identity).await? {
        let Some(raw) = &ctl.agent_version else {
            continue;
        };
        let Ok(version) = Version::parse(raw) else {
            debug!(controller = %ctl.path, version = %raw, "cannot parse agent version");
            continue;
        };
        if earliest.as_ref().is_none_or(|v| version < *v) {
            earliest = Some(version);
        }
    }
    Ok(earliest)
}

/// Picks a random readable controller, used when placing new clouds.
pub async fn select_random_controller(
    state: &AppState,
    identity: &Identity,
) -> Result<ControllerRecord> {
    let mut candidates = readable_available_controllers(state, identity).await?;
    if candidates.is_empty() {
        return Err(Error::internal("cannot find a suitable controller"));
    }
    let n = state.runtime.pick_index(candidates.len());
    Ok(candidates.remove(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations::init_test_db;
    use crate::persistence::NewController;

    async fn seed(db: &db::Db, name: &str, public: bool, version: Option<&str>) {
        let path = EntityPath::new("admin", name);
        db::controllers::add_controller(
            db,
            NewController {
                path: path.clone(),
                uuid: uuid::Uuid::new_v4().to_string(),
                hosts: vec![format!("{name}.example:17070")],
                ca_cert: None,
                admin_user: "admin".to_string(),
                admin_password: "pw".to_string(),
                public,
            },
        )
        .await
        .expect("add");
        if let Some(version) = version {
            db::controllers::set_agent_version(db, &path, version)
                .await
                .expect("version");
        }
    }

    #[tokio::test]
    async fn earliest_version_ignores_private_and_unversioned() {
        let db = init_test_db().await;
        seed(&db, "a", true, Some("2.9.33")).await;
        seed(&db, "b", true, Some("2.8.1")).await;
        seed(&db, "c", false, Some("1.0.0")).await;
        seed(&db, "d", true, None).await;

        let state = crate::testing::state_with_db(db);
        let admin = Identity {
            username: "root".to_string(),
            admin: true,
        };
        let earliest = earliest_controller_version(&state, &admin)
            .await
            .expect("earliest");
        assert_eq!(earliest, Some(Version::parse("2.8.1").expect("semver")));
    }
}
