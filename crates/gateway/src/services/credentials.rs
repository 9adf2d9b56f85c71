//! Credential engine: storage, validation, redaction and propagation to
//! every controller using a credential.

use tokio::sync::mpsc;
use tracing::{error, warn};

use common::api::CredentialContent;
use common::params::{cloud_credential_tag, CredentialPath, EntityPath};

use crate::app_state::AppState;
use crate::auth::Identity;
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::persistence::{self as db, CredentialRecord, NewCredential};
use crate::upstream::ControllerApi;

/// Retrieves a credential, validating that the identity may read it.
/// Attempts to probe another user's namespace answer `Unauthorized` whether
/// or not the credential exists.
pub async fn get_credential(
    state: &AppState,
    identity: &Identity,
    path: &CredentialPath,
) -> Result<CredentialRecord> {
    match db::credentials::get_credential(&state.db, path).await? {
        Some(cred) => {
            crate::authz::check_can_read(identity, &cred)?;
            Ok(cred)
        }
        None => {
            if state
                .authenticator
                .check_is_user(identity, &path.user)
                .is_err()
            {
                return Err(Error::unauthorized("unauthorized"));
            }
            Err(Error::not_found(format!("credential {path:?} not found")))
        }
    }
}

/// Pushes one credential to a controller: revoked credentials are revoked,
/// live ones updated with their auth type and attributes.
pub async fn push_credential(
    _ctx: &Context,
    api: &dyn ControllerApi,
    cred: &CredentialRecord,
) -> Result<()> {
    let tag = cloud_credential_tag(&cred.credential_path());
    if cred.revoked {
        api.revoke_credential(&tag).await
    } else {
        api.update_credential(&tag, &cred.auth_type, &cred.attributes.0)
            .await
    }
    .map_err(|err| err.context("cannot update credentials"))
}

/// Updates a credential locally, then fans out a push to every controller it
/// has been deployed to. Individual push failures are logged, not surfaced:
/// the affected controllers keep their update flag set and the monitor
/// drains them later.
pub async fn update_credential(
    state: &AppState,
    ctx: &Context,
    identity: &Identity,
    new: NewCredential,
) -> Result<CredentialRecord> {
    state.authenticator.check_is_user(identity, &new.path.user)?;

    let cred = db::credentials::set_cloud_credential(&state.db, &new)
        .await
        .map_err(|err| err.context("cannot update local database"))?;
    let controllers = db::credentials::credential_controllers(&state.db, &new.path).await?;

    // Flag every deployed controller before pushing, so a crash between
    // here and the pushes leaves the monitor something to drain.
    if let Err(err) =
        db::credentials::set_credential_updates(&state.db, &controllers, &new.path).await
    {
        error!(cred = %new.path, %err, "cannot update controllers with updated credential");
    }

    let n = controllers.len();
    // Buffered so stragglers don't leak when the context is cancelled.
    let (tx, mut rx) = mpsc::channel::<()>(n.max(1));
    for ctl_path in controllers {
        let state = state.clone();
        let cred = cred.clone();
        let tx = tx.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let Ok(ctl_path) = ctl_path.parse::<EntityPath>() else {
                let _ = tx.send(()).await;
                return;
            };
            if let Err(err) =
                update_controller_credential(&state, &ctx, &ctl_path, &cred.credential_path(), Some(&cred))
                    .await
            {
                warn!(cred = %cred.path, controller = %ctl_path, %err, "cannot update credential");
            }
            let _ = tx.send(()).await;
        });
    }
    drop(tx);

    // Wait for the pushes, or for as long as the caller's context allows.
    let mut remaining = n;
    while remaining > 0 {
        tokio::select! {
            received = rx.recv() => match received {
                Some(()) => remaining -= 1,
                None => break,
            },
            _ = ctx.cancelled() => break,
        }
    }

    Ok(cred)
}

/// Drains a controller's pending credential updates: push each flagged
/// credential, clearing the flag only after a successful push.
pub async fn controller_update_credentials(
    state: &AppState,
    ctx: &Context,
    ctl_path: &EntityPath,
) -> Result<()> {
    let pending = db::credentials::pending_credential_updates(&state.db, ctl_path).await?;
    for cred_path in pending {
        let Ok(cred_path) = cred_path.parse::<CredentialPath>() else {
            continue;
        };
        if let Err(err) =
            update_controller_credential(state, ctx, ctl_path, &cred_path, None).await
        {
            warn!(cred = %cred_path, controller = %ctl_path, %err, "cannot update credential");
        }
    }
    Ok(())
}

/// Pushes one credential to one controller and clears its update flag on
/// success.
async fn update_controller_credential(
    state: &AppState,
    ctx: &Context,
    ctl_path: &EntityPath,
    cred_path: &CredentialPath,
    cred: Option<&CredentialRecord>,
) -> Result<()> {
    let conn = state.open_api(ctx, ctl_path).await?;
    let loaded;
    let cred = match cred {
        Some(cred) => cred,
        None => {
            loaded = db::credentials::get_credential(&state.db, cred_path)
                .await?
                .ok_or_else(|| Error::not_found(format!("credential {cred_path:?} not found")))?;
            &loaded
        }
    };
    push_credential(ctx, conn.api(), cred).await?;

    if let Err(err) = db::credentials::clear_credential_update(&state.db, ctl_path, cred_path).await
    {
        error!(
            cred = %cred_path,
            controller = %ctl_path,
            %err,
            "failed to update controller after successfully updating credential"
        );
    }
    Ok(())
}

/// Renders a credential for the given caller, redacting what they may not
/// see. The owner reads everything; a non-owner admin may read non-secret
/// attributes but asking for secrets is refused outright.
pub fn redacted_contents(
    identity: &Identity,
    cred: &CredentialRecord,
    include_secrets: bool,
) -> Result<CredentialContent> {
    let owner = identity.username == cred.owner;
    if !owner && !identity.admin {
        return Err(Error::unauthorized("unauthorized"));
    }
    if !owner && include_secrets {
        return Err(Error::unauthorized("unauthorized"));
    }

    let mut attrs = std::collections::HashMap::new();
    let mut redacted = Vec::new();
    for (key, value) in &cred.attributes.0 {
        if owner || !cred.is_secret(key) {
            attrs.insert(key.clone(), value.clone());
        } else {
            redacted.push(key.clone());
        }
    }
    redacted.sort();

    Ok(CredentialContent {
        name: cred.name.clone(),
        cloud: cred.cloud.clone(),
        auth_type: cred.auth_type.clone(),
        attrs,
        redacted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::types::Json;
    use std::collections::HashMap;

    fn cred() -> CredentialRecord {
        CredentialRecord {
            path: "aws/alice/default".to_string(),
            cloud: "aws".to_string(),
            owner: "alice".to_string(),
            name: "default".to_string(),
            auth_type: "userpass".to_string(),
            attributes: Json(HashMap::from([
                ("username".to_string(), "alice".to_string()),
                ("password".to_string(), "s3cret".to_string()),
            ])),
            hidden_keys: Json(vec!["password".to_string()]),
            revoked: false,
            valid: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn user(name: &str, admin: bool) -> Identity {
        Identity {
            username: name.to_string(),
            admin,
        }
    }

    #[test]
    fn owner_reads_all_attributes() {
        let contents = redacted_contents(&user("alice", false), &cred(), true).expect("owner");
        assert_eq!(contents.attrs.len(), 2);
        assert!(contents.redacted.is_empty());
    }

    #[test]
    fn admin_reads_public_attributes_with_redaction_list() {
        let contents = redacted_contents(&user("root", true), &cred(), false).expect("admin");
        assert_eq!(
            contents.attrs.keys().collect::<Vec<_>>(),
            vec![&"username".to_string()]
        );
        assert_eq!(contents.redacted, vec!["password".to_string()]);
    }

    #[test]
    fn admin_requesting_secrets_is_refused() {
        let err = redacted_contents(&user("root", true), &cred(), true).expect_err("refused");
        assert_eq!(err.code(), crate::error::ErrorCode::Unauthorized);
    }

    #[test]
    fn other_users_are_refused() {
        let err = redacted_contents(&user("bob", false), &cred(), false).expect_err("refused");
        assert_eq!(err.code(), crate::error::ErrorCode::Unauthorized);
    }
}
