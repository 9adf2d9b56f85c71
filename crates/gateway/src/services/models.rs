//! Model lifecycle: create, destroy, grant/revoke, migrate.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{error, info, warn};

use common::api::{MigrateModelInfo, MigrationEvent, ModelCreateArgs, ModelInfo};
use common::params::{
    cloud_credential_tag, cloud_tag, parse_model_tag, user_tag, CredentialPath, EntityPath,
    ErrorCode,
};

use crate::app_state::AppState;
use crate::auth::Identity;
use crate::authz;
use crate::ctx::{run_with_context, Context};
use crate::error::{Error, Result};
use crate::persistence::{self as db, AuditEntry, CanReadIter, CredentialRecord, ModelRecord};
use crate::services::credentials::push_credential;

/// Parameters for creating a model.
#[derive(Debug, Clone)]
pub struct CreateModelParams {
    /// Path of the new model; the caller must own the namespace.
    pub path: EntityPath,
    /// Pin creation to one controller instead of selecting by region.
    pub controller_path: Option<EntityPath>,
    /// Credential to use; `None` selects by `(owner, cloud)`.
    pub credential: Option<CredentialPath>,
    pub cloud: String,
    pub region: String,
    pub attributes: HashMap<String, Value>,
}

/// Creates a model: reserve the path locally under a placeholder UUID, try
/// each candidate controller until one accepts the create, then reconcile
/// the reserved row with the real model.
pub async fn create_model(
    state: &AppState,
    ctx: &Context,
    identity: &Identity,
    params: CreateModelParams,
) -> Result<ModelRecord> {
    // Only the owner can create a new model in their namespace.
    state
        .authenticator
        .check_is_user(identity, &params.path.user)?;

    let usage_sender_credentials = match &state.usage_client {
        Some(client) => Some(client.get_credentials(&params.path.user).await?),
        None => None,
    };

    let cred = select_credential(
        state,
        identity,
        params.credential.as_ref(),
        &params.path.user,
        &params.cloud,
    )
    .await?;

    let candidates = possible_controllers(
        state,
        identity,
        params.controller_path.clone(),
        &params.cloud,
        &params.region,
    )
    .await?;

    // Reserve the path before creating anything remotely. The placeholder
    // UUID keeps the uuid column unique while the real one is unknown.
    let reserved = db::models::add_model(
        &state.db,
        db::NewModel {
            path: params.path.clone(),
            controller_path: None,
            uuid: state.runtime.placeholder_uuid(),
            creator: identity.username.clone(),
            credential_path: cred.as_ref().map(|c| c.path.clone()),
            usage_sender_credentials,
        },
    )
    .await?;

    let result = create_on_candidates(state, ctx, identity, &params, cred.as_ref(), &candidates).await;
    let (ctl_path, info) = match result {
        Ok(ok) => ok,
        Err(err) => {
            // Remove the reservation. The remote side may still hold a
            // model if the failure happened after the create; that orphan
            // surfaces as "model name in use" on the next attempt.
            if let Err(derr) = db::models::delete_model(&state.db, &reserved.entity_path()).await {
                error!(model = %params.path, %derr, "cannot remove model from database after error; leaked model");
            }
            return Err(err);
        }
    };

    let updated = db::models::reconcile_created_model(
        &state.db,
        &params.path,
        db::ModelReconcile {
            uuid: info.uuid.clone(),
            controller_path: ctl_path.clone(),
            cloud: params.cloud.clone(),
            cloud_region: info.cloud_region.clone(),
            default_series: Some(info.default_series.clone()),
            model_type: Some(info.model_type.clone()),
            provider_type: Some(info.provider_type.clone()),
            life: info.life.as_str().to_string(),
            status: Some(info.status.status.clone()),
            status_message: Some(info.status.info.clone()),
            status_since: info.status.since,
            agent_version: info.agent_version.clone(),
        },
    )
    .await;
    let updated = match updated {
        Ok(model) => model,
        Err(err) => {
            if let Err(derr) = db::models::delete_model(&state.db, &params.path).await {
                error!(model = %params.path, %derr, "cannot remove model from database after error; leaked model");
            }
            return Err(err);
        }
    };

    if let Err(err) = db::audit::append_audit(
        &state.db,
        state.runtime.now(),
        &AuditEntry::ModelCreated {
            path: params.path.to_string(),
            uuid: info.uuid.clone(),
            owner: params.path.user.clone(),
            creator: identity.username.clone(),
            controller_path: ctl_path.to_string(),
            cloud: params.cloud.clone(),
            region: info.cloud_region.clone(),
        },
    )
    .await
    {
        error!(%err, "cannot add audit log for model creation");
    }

    Ok(updated)
}

async fn create_on_candidates(
    state: &AppState,
    ctx: &Context,
    identity: &Identity,
    params: &CreateModelParams,
    cred: Option<&CredentialRecord>,
    candidates: &[EntityPath],
) -> Result<(EntityPath, ModelInfo)> {
    let mut name_in_use: Option<Error> = None;
    for ctl_path in candidates {
        match create_model_on_controller(state, ctx, identity, ctl_path, params, cred).await {
            Ok(info) => return Ok((ctl_path.clone(), info)),
            Err(err) if err.code() == ErrorCode::InvalidModelParams => {
                return Err(err.context("cannot create model"));
            }
            Err(err) => {
                error!(controller = %ctl_path, %err, "cannot create model on controller");
                if err.code() == ErrorCode::AlreadyExists {
                    name_in_use = Some(err);
                }
            }
        }
    }
    // A name collision on a controller (an orphan from an earlier failed
    // create) is more actionable than the generic exhaustion error.
    match name_in_use {
        Some(err) => Err(err),
        None => Err(Error::internal("cannot find suitable controller")),
    }
}

async fn create_model_on_controller(
    state: &AppState,
    ctx: &Context,
    identity: &Identity,
    ctl_path: &EntityPath,
    params: &CreateModelParams,
    cred: Option<&CredentialRecord>,
) -> Result<ModelInfo> {
    let ctl = db::controllers::get_controller(&state.db, ctl_path)
        .await?
        .ok_or_else(|| Error::not_found(format!("controller {ctl_path} not found")))
        .map_err(|err| err.context("cannot get controller document"))?;
    authz::check_can_read(identity, &ctl)?;
    if ctl.deprecated {
        return Err(Error::bad_request("controller deprecated"));
    }

    let conn = state
        .open_api_from_record(ctx, &ctl)
        .await
        .map_err(|err| err.context("cannot connect to controller"))?;

    let mut credential_tag = String::new();
    if let Some(cred) = cred {
        push_credential(ctx, conn.api(), cred)
            .await
            .map_err(|err| err.context("cannot add credential"))?;
        credential_tag = cloud_credential_tag(&cred.credential_path());
    }

    let args = ModelCreateArgs {
        name: params.path.name.clone(),
        owner_tag: user_tag(&params.path.user),
        cloud_tag: cloud_tag(&params.cloud),
        region: params.region.clone(),
        credential_tag,
        config: params.attributes.clone(),
    };
    let api = conn.api();
    let info = match api.create_model(&args).await {
        Ok(info) => info,
        Err(err) => {
            return Err(match err.code() {
                // The model already exists on the controller but not in the
                // index: most likely abandoned by an earlier failed create.
                ErrorCode::AlreadyExists => err.context("model name in use"),
                ErrorCode::UpgradeInProgress => err.context("upgrade in progress"),
                // The request itself is bad; no other controller will
                // accept it either.
                _ => err.mask(ErrorCode::InvalidModelParams, "invalid CreateModel request"),
            });
        }
    };

    // Grant the gateway's login identity admin on the new model. If this
    // fails the local row is removed but the remote model remains; it shows
    // up as "model name in use" at the next attempt.
    let admin_tag = format!("user-{}", conn.info().user);
    if let Err(err) = api.grant_model(&admin_tag, "admin", &info.uuid).await {
        error!(
            controller = %ctl_path,
            model = %params.path,
            model_uuid = %info.uuid,
            %err,
            "leaked model"
        );
        return Err(err.context("cannot grant model access"));
    }

    // Record the binding only once the controller actually hosts a model
    // using the credential; candidates that received the push but rejected
    // the create are not tracked.
    if let Some(cred) = cred {
        db::credentials::credential_add_controller(&state.db, &cred.credential_path(), ctl_path)
            .await
            .map_err(|err| err.context("cannot add credential"))?;
    }
    Ok(info)
}

/// Chooses a credential appropriate for the user in the given cloud.
///
/// More than one usable credential is an `AmbiguousChoice`; an explicit
/// credential that does not exist is `NotFound`; no credentials at all with
/// no explicit request means "proceed without credential".
async fn select_credential(
    state: &AppState,
    identity: &Identity,
    path: Option<&CredentialPath>,
    user: &str,
    cloud: &str,
) -> Result<Option<CredentialRecord>> {
    let matches = match path {
        Some(path) => db::credentials::get_credential(&state.db, path)
            .await?
            .into_iter()
            .collect(),
        None => db::credentials::credentials_for_owner_cloud(&state.db, user, cloud).await?,
    };
    let mut readable = CanReadIter::new(identity, matches).collect_all()?;
    match readable.len() {
        0 => match path {
            Some(path) => Err(Error::not_found(format!("credential {path:?} not found"))),
            None => Ok(None),
        },
        1 => Ok(Some(readable.remove(0))),
        _ => Err(Error::ambiguous_choice(
            "more than one possible credential to use",
        )),
    }
}

/// Candidate controllers for a create: the pinned controller if one was
/// named, otherwise the region's primaries (falling back to secondaries),
/// shuffled to spread load.
async fn possible_controllers(
    state: &AppState,
    identity: &Identity,
    ctl_path: Option<EntityPath>,
    cloud: &str,
    region: &str,
) -> Result<Vec<EntityPath>> {
    if let Some(path) = ctl_path {
        return Ok(vec![path]);
    }
    let cloud_region = db::clouds::get_cloud_region(&state.db, cloud, region)
        .await?
        .ok_or_else(|| Error::not_found(format!("cloud {cloud:?} region {region:?} not found")))?;
    authz::check_can_read(identity, &cloud_region)?;

    let raw = if cloud_region.primary_controllers.0.is_empty() {
        &cloud_region.secondary_controllers.0
    } else {
        &cloud_region.primary_controllers.0
    };
    let mut controllers = Vec::with_capacity(raw.len());
    for path in raw {
        controllers.push(
            path.parse::<EntityPath>()
                .map_err(|err| Error::internal(err.to_string()))?,
        );
    }
    state.runtime.shuffle(&mut controllers);
    Ok(controllers)
}

/// Which ACL check to apply when resolving a model tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelAuth {
    None,
    Read,
    Write,
    Admin,
}

/// Resolves a model tag to its index row, applying the requested ACL check.
/// Invalid tags are `BadRequest`; missing models are `NotFound`.
pub async fn get_model(
    state: &AppState,
    identity: &Identity,
    tag: &str,
    auth: ModelAuth,
) -> Result<ModelRecord> {
    let uuid = parse_model_tag(tag)
        .map_err(|err| Error::bad_request("invalid model tag").with_cause(anyhow::anyhow!(err)))?;
    let model = db::models::model_from_uuid(&state.db, &uuid.to_string())
        .await?
        .ok_or_else(|| Error::not_found(format!("model {uuid} not found")))?;
    match auth {
        ModelAuth::None => {}
        ModelAuth::Read => authz::check_can_read(identity, &model)?,
        ModelAuth::Write => authz::check_can_write(identity, &model)?,
        ModelAuth::Admin => authz::check_is_admin(identity, &model)?,
    }
    Ok(model)
}

/// All models the identity can read, in path order.
pub async fn readable_models(state: &AppState, identity: &Identity) -> Result<Vec<ModelRecord>> {
    let all = db::models::list_models(&state.db).await?;
    CanReadIter::new(identity, all).collect_all()
}

/// Builds the client-facing model description from the index alone.
pub async fn model_info_from_index(
    state: &AppState,
    identity: &Identity,
    model: &ModelRecord,
    mask_controller_uuid: bool,
) -> Result<ModelInfo> {
    let mut provider_type = model.provider_type.clone().unwrap_or_default();
    if provider_type.is_empty() {
        provider_type = db::clouds::provider_type(&state.db, &model.cloud)
            .await
            .map_err(|err| err.context(format!("cannot get cloud {:?}", model.cloud)))?;
    }

    let mut levels: HashMap<String, &'static str> = HashMap::new();
    for user in &model.acl_read.0 {
        levels.insert(user.clone(), "read");
    }
    for user in &model.acl_write.0 {
        levels.insert(user.clone(), "write");
    }
    for user in &model.acl_admin.0 {
        levels.insert(user.clone(), "admin");
    }
    levels.insert(model.owner(), "admin");

    // Admins see the full user list; everyone else sees just themselves.
    let mut users: Vec<common::api::ModelUserInfo> = Vec::new();
    if authz::check_is_admin(identity, model).is_ok() {
        let mut names: Vec<_> = levels.keys().cloned().collect();
        names.sort();
        for name in names {
            users.push(common::api::ModelUserInfo {
                user_name: user_tag(&name),
                display_name: name.clone(),
                access: levels[&name].to_string(),
            });
        }
    } else if let Some(access) = levels.get(&identity.username) {
        users.push(common::api::ModelUserInfo {
            user_name: identity.tag(),
            display_name: identity.username.clone(),
            access: access.to_string(),
        });
    }

    let machines = db::inventory::machines_for_model(&state.db, &model.uuid).await?;
    let machine_infos = machines
        .iter()
        .filter(|m| m.info.0.get("life").and_then(Value::as_str) != Some("dead"))
        .map(|m| common::api::ModelMachineInfo {
            id: m.machine_id.clone(),
            instance_id: m
                .info
                .0
                .get("instance-id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status: m
                .info
                .0
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            has_vote: false,
            wants_vote: false,
            hardware: None,
        })
        .collect();

    let controller_uuid = if mask_controller_uuid {
        state.controller_uuid.clone()
    } else {
        let ctl = db::controllers::get_controller(&state.db, &model.controller_entity_path())
            .await?
            .ok_or_else(|| {
                Error::internal(format!(
                    "failed to fetch controller: {}",
                    model.controller_path
                ))
            })?;
        ctl.uuid
    };

    Ok(ModelInfo {
        name: model.entity_path().name,
        uuid: model.uuid.clone(),
        controller_uuid,
        provider_type,
        default_series: model.default_series.clone().unwrap_or_default(),
        cloud_tag: cloud_tag(&model.cloud),
        cloud_region: model.cloud_region.clone(),
        cloud_credential_tag: model
            .credential_path
            .as_deref()
            .and_then(|p| p.parse::<CredentialPath>().ok())
            .map(|p| cloud_credential_tag(&p))
            .unwrap_or_default(),
        owner_tag: user_tag(&model.owner()),
        life: model.life(),
        status: common::api::EntityStatus {
            status: model.status.clone().unwrap_or_default(),
            info: model.status_message.clone().unwrap_or_default(),
            since: model.status_since,
        },
        users,
        machines: machine_infos,
        agent_version: model.agent_version.clone(),
        model_type: model.model_type.clone().unwrap_or_default(),
    })
}

/// Full model info: the index view refreshed from the owning controller.
///
/// A dying model whose controller now answers `Unauthorized` is assumed
/// dead: its local row is reaped and the caller sees `Unauthorized`.
pub async fn model_info(
    state: &AppState,
    ctx: &Context,
    identity: &Identity,
    tag: &str,
    mask_controller_uuid: bool,
) -> Result<ModelInfo> {
    let model = get_model(state, identity, tag, ModelAuth::Read).await?;
    let local = model_info_from_index(state, identity, &model, mask_controller_uuid).await?;

    match fetch_remote_model_info(state, ctx, &model).await {
        Ok(remote) => {
            let mut info = local;
            info.life = remote.life;
            info.status = remote.status;
            info.agent_version = remote.agent_version.or(info.agent_version);
            Ok(info)
        }
        Err(err) if model.life() == common::api::Life::Dying
            && err.code() == ErrorCode::Unauthorized =>
        {
            info!(model_uuid = %model.uuid, %err, "could not get ModelInfo for dying model, marking dead");
            if let Err(derr) = db::models::delete_model_with_uuid(
                &state.db,
                &model.controller_entity_path(),
                &model.uuid,
            )
            .await
            {
                // The monitor will pick the state change up if this fails.
                warn!(model_uuid = %model.uuid, %derr, "error deleting model");
            }
            Err(err.mask(ErrorCode::Unauthorized, "unauthorized"))
        }
        Err(err) => {
            // Answer from the index; most of the information is there.
            error!(controller = %model.controller_path, %err, "failed to get ModelInfo from controller");
            Ok(local)
        }
    }
}

async fn fetch_remote_model_info(
    state: &AppState,
    ctx: &Context,
    model: &ModelRecord,
) -> Result<ModelInfo> {
    let conn = state.open_api(ctx, &model.controller_entity_path()).await?;
    let api = conn.clone_api();
    let uuid = model.uuid.clone();
    run_with_context(ctx, async move { api.model_info(&uuid).await }).await
}

/// Destroys a model: ask the controller to tear it down, mark the local row
/// dying, and leave final removal to the monitor.
pub async fn destroy_model(
    state: &AppState,
    ctx: &Context,
    identity: &Identity,
    tag: &str,
    destroy_storage: Option<bool>,
) -> Result<()> {
    let model = get_model(state, identity, tag, ModelAuth::Admin).await?;
    let conn = state.open_api(ctx, &model.controller_entity_path()).await?;

    conn.api().destroy_model(&model.uuid, destroy_storage).await?;

    if let Err(err) = db::models::set_model_life(
        &state.db,
        &model.controller_entity_path(),
        &model.uuid,
        "dying",
    )
    .await
    {
        // The watcher will detect the state change and update accordingly.
        warn!(model_uuid = %model.uuid, %err, "error updating model life");
    }

    if let Err(err) = db::audit::append_audit(
        &state.db,
        state.runtime.now(),
        &AuditEntry::ModelDestroyed {
            path: model.path.clone(),
            uuid: model.uuid.clone(),
            initiator: identity.username.clone(),
        },
    )
    .await
    {
        error!(%err, "cannot add audit log for model destruction");
    }
    Ok(())
}

/// Grants access on a model: the index row changes first, then the
/// controller is updated to match.
pub async fn grant_model(
    state: &AppState,
    ctx: &Context,
    identity: &Identity,
    tag: &str,
    user: &str,
    access: &str,
) -> Result<()> {
    let model = get_model(state, identity, tag, ModelAuth::Admin).await?;
    let access = db::models::ModelAccess::parse(access)?;
    db::models::grant_model(&state.db, &model.entity_path(), user, access).await?;

    let conn = state.open_api(ctx, &model.controller_entity_path()).await?;
    conn.api()
        .grant_model(&user_tag(user), access.as_str(), &model.uuid)
        .await
        .map_err(|err| {
            warn!(model = %model.path, %user, %err, "controller grant failed after local grant");
            err
        })
}

/// Revokes access on a model, index row first.
pub async fn revoke_model(
    state: &AppState,
    ctx: &Context,
    identity: &Identity,
    tag: &str,
    user: &str,
    access: &str,
) -> Result<()> {
    let model = get_model(state, identity, tag, ModelAuth::Admin).await?;
    let access = db::models::ModelAccess::parse(access)?;
    db::models::revoke_model(&state.db, &model.entity_path(), user, access).await?;

    let conn = state.open_api(ctx, &model.controller_entity_path()).await?;
    conn.api()
        .revoke_model(&user_tag(user), access.as_str(), &model.uuid)
        .await
        .map_err(|err| {
            warn!(model = %model.path, %user, %err, "controller revoke failed after local revoke");
            err
        })
}

/// Migrates each named model to its target controller. Each spec is
/// processed independently; per-model progress is reported through `emit`.
pub async fn migrate_models(
    state: &AppState,
    ctx: &Context,
    identity: &Identity,
    specs: &[MigrateModelInfo],
    emit: &mut (dyn FnMut(MigrationEvent) + Send),
) -> Result<()> {
    state.authenticator.check_is_admin(identity)?;
    for spec in specs {
        let event = |phase: &str, message: String| MigrationEvent {
            model_tag: spec.model_tag.clone(),
            target_controller: spec.target_controller.clone(),
            phase: phase.to_string(),
            message,
            time: state.runtime.now(),
        };
        match migrate_one(state, ctx, identity, spec).await {
            Ok(migration_id) => emit(event("initiated", migration_id)),
            Err(err) => emit(event("failed", err.to_string())),
        }
    }
    Ok(())
}

async fn migrate_one(
    state: &AppState,
    ctx: &Context,
    identity: &Identity,
    spec: &MigrateModelInfo,
) -> Result<String> {
    let model = get_model(state, identity, &spec.model_tag, ModelAuth::Admin).await?;
    let target = resolve_controller_by_name(state, &spec.target_controller).await?;
    if target.path == model.controller_path {
        return Err(Error::bad_request(
            "model is already on the target controller",
        ));
    }

    let conn = state.open_api(ctx, &model.controller_entity_path()).await?;
    let migration_id = conn
        .api()
        .migrate_model(
            &model.uuid,
            &crate::upstream::MigrationTarget {
                controller_uuid: target.uuid.clone(),
                hosts: target.hosts.0.clone(),
                ca_cert: target.ca_cert.clone(),
                user: target.admin_user.clone(),
                password: target.admin_password.clone(),
            },
        )
        .await?;

    // Track the move; the monitor reconciles the fine-grained state as the
    // migration progresses on the controllers.
    db::models::set_model_controller(&state.db, &model.entity_path(), &target.entity_path())
        .await?;
    Ok(migration_id)
}

/// Resolves a target controller by bare name or full `user/name` path. A
/// bare name matching more than one controller is an `AmbiguousChoice`.
pub async fn resolve_controller_by_name(
    state: &AppState,
    name: &str,
) -> Result<db::ControllerRecord> {
    if name.contains('/') {
        let path: EntityPath = name
            .parse()
            .map_err(|err: common::params::ParseError| Error::bad_request(err.to_string()))?;
        return db::controllers::get_controller(&state.db, &path)
            .await?
            .ok_or_else(|| Error::not_found(format!("controller {path} not found")));
    }
    let all = db::controllers::list_controllers(&state.db).await?;
    let mut matches: Vec<_> = all
        .into_iter()
        .filter(|c| c.entity_path().name == name)
        .collect();
    match matches.len() {
        0 => Err(Error::not_found(format!("controller {name:?} not found"))),
        1 => Ok(matches.remove(0)),
        _ => Err(Error::ambiguous_choice(format!(
            "more than one controller named {name:?}"
        ))),
    }
}
