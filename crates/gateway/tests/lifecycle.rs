//! End-to-end model lifecycle scenarios against scripted fake controllers.

use std::collections::HashMap;
use std::sync::Arc;

use common::params::{CredentialPath, EntityPath, ErrorCode};

use gateway::auth::Identity;
use gateway::ctx::Context;
use gateway::persistence::{self as db, migrations::init_test_db, NewCloudRegion, NewCredential};
use gateway::services::{credentials, models};
use gateway::testing::{FakeControllerApi, FakeDialer, ScriptedError};

struct Harness {
    state: gateway::app_state::AppState,
    dialer: Arc<FakeDialer>,
}

impl Harness {
    async fn new() -> Self {
        let db = init_test_db().await;
        let dialer = Arc::new(FakeDialer::default());
        let (state, _clock) = gateway::testing::state_with_db_and_dialer(db, dialer.clone());
        Self { state, dialer }
    }

    async fn add_controller(&self, name: &str) -> (EntityPath, Arc<FakeControllerApi>) {
        let path = EntityPath::new("admin", name);
        let host = format!("{name}.example:17070");
        let api = Arc::new(FakeControllerApi::new("2.9.33"));
        self.dialer.register(&host, api.clone());
        db::controllers::add_controller(
            &self.state.db,
            db::NewController {
                path: path.clone(),
                uuid: uuid::Uuid::new_v4().to_string(),
                hosts: vec![host],
                ca_cert: None,
                admin_user: "admin".to_string(),
                admin_password: "pw".to_string(),
                public: true,
            },
        )
        .await
        .expect("add controller");
        (path, api)
    }

    async fn add_region(&self, cloud: &str, region: &str, primaries: &[&EntityPath]) {
        for r in ["", region] {
            let row = NewCloudRegion {
                cloud: cloud.to_string(),
                region: r.to_string(),
                provider_type: if r.is_empty() {
                    "ec2".to_string()
                } else {
                    String::new()
                },
                auth_types: vec!["userpass".to_string()],
                primary_controllers: primaries.iter().map(|p| p.to_string()).collect(),
                ..Default::default()
            };
            db::clouds::insert_cloud_region(&self.state.db, &row)
                .await
                .expect("insert region");
        }
    }

    async fn add_credential(&self, owner: &str, name: &str) -> CredentialPath {
        let path = CredentialPath::new("aws", owner, name);
        db::credentials::set_cloud_credential(
            &self.state.db,
            &NewCredential {
                path: path.clone(),
                auth_type: "userpass".to_string(),
                attributes: HashMap::from([
                    ("username".to_string(), owner.to_string()),
                    ("password".to_string(), "s3cret".to_string()),
                ]),
                hidden_keys: vec!["password".to_string()],
                revoked: false,
            },
        )
        .await
        .expect("set credential");
        path
    }

    fn alice(&self) -> Identity {
        Identity {
            username: "alice".to_string(),
            admin: false,
        }
    }

    fn create_params(&self, name: &str) -> models::CreateModelParams {
        models::CreateModelParams {
            path: EntityPath::new("alice", name),
            controller_path: None,
            credential: None,
            cloud: "aws".to_string(),
            region: "eu-west-1".to_string(),
            attributes: HashMap::new(),
        }
    }
}

#[tokio::test]
async fn create_succeeds_on_second_candidate_when_first_is_upgrading() {
    let h = Harness::new().await;
    let (ctl1, api1) = h.add_controller("ctl1").await;
    let (ctl2, api2) = h.add_controller("ctl2").await;
    h.add_region("aws", "eu-west-1", &[&ctl1, &ctl2]).await;
    h.add_credential("alice", "default").await;

    api1.script_create(Some(ScriptedError::new(
        ErrorCode::UpgradeInProgress,
        "upgrade in progress",
    )));

    let model = models::create_model(
        &h.state,
        &Context::background(),
        &h.alice(),
        h.create_params("staging"),
    )
    .await
    .expect("create succeeds on the second candidate");

    // The reserved row was reconciled with the UUID minted by ctl2.
    assert!(!model.is_placeholder());
    assert_eq!(model.controller_path, ctl2.to_string());
    let created = api2.created_models();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].uuid, model.uuid);

    // Both candidates received the credential push, but only the
    // controller that accepted the create is recorded as using it.
    let cred_path = CredentialPath::new("aws", "alice", "default");
    let bound = db::credentials::credential_controllers(&h.state.db, &cred_path)
        .await
        .expect("controllers");
    assert_eq!(bound, vec![ctl2.to_string()]);
    assert_eq!(api1.credential_updates().len(), 1);
    assert_eq!(api2.credential_updates().len(), 1);

    // The audit entry names the controller that accepted the create.
    let audit = db::audit::list_audit(&h.state.db, 10).await.expect("audit");
    assert_eq!(audit.len(), 1);
    match audit[0].entry() {
        Some(db::AuditEntry::ModelCreated {
            controller_path, ..
        }) => assert_eq!(controller_path, ctl2.to_string()),
        other => panic!("unexpected audit entry: {other:?}"),
    }
}

#[tokio::test]
async fn grant_failure_after_remote_create_leaves_actionable_orphan() {
    let h = Harness::new().await;
    let (ctl1, api1) = h.add_controller("ctl1").await;
    h.add_region("aws", "eu-west-1", &[&ctl1]).await;
    h.add_credential("alice", "default").await;

    // The remote create succeeds but granting the gateway admin fails, so
    // the remote model is an orphan.
    api1.script_grant(Some(ScriptedError::new(
        ErrorCode::Unauthorized,
        "permission denied",
    )));

    let err = models::create_model(
        &h.state,
        &Context::background(),
        &h.alice(),
        h.create_params("staging"),
    )
    .await
    .expect_err("create fails");
    assert_eq!(err.code(), ErrorCode::Internal);

    // The local reservation is gone, but the controller kept the model.
    assert!(db::models::get_model(&h.state.db, &EntityPath::new("alice", "staging"))
        .await
        .expect("get")
        .is_none());
    assert_eq!(api1.created_models().len(), 1);

    // A retry with the same name now collides with the orphan.
    api1.script_create(Some(ScriptedError::new(
        ErrorCode::AlreadyExists,
        "model \"staging\" already exists",
    )));
    let err = models::create_model(
        &h.state,
        &Context::background(),
        &h.alice(),
        h.create_params("staging"),
    )
    .await
    .expect_err("name in use");
    assert_eq!(err.code(), ErrorCode::AlreadyExists);
    assert!(err.to_string().contains("model name in use"));
}

#[tokio::test]
async fn invalid_model_params_stop_the_candidate_loop() {
    let h = Harness::new().await;
    let (ctl1, api1) = h.add_controller("ctl1").await;
    let (ctl2, api2) = h.add_controller("ctl2").await;
    h.add_region("aws", "eu-west-1", &[&ctl1, &ctl2]).await;

    api1.script_create(Some(ScriptedError::new(
        ErrorCode::BadRequest,
        "invalid config value",
    )));

    let err = models::create_model(
        &h.state,
        &Context::background(),
        &h.alice(),
        h.create_params("staging"),
    )
    .await
    .expect_err("fatal create error");
    assert_eq!(err.code(), ErrorCode::InvalidModelParams);

    // The second candidate was never asked.
    assert!(api2.created_models().is_empty());
}

#[tokio::test]
async fn two_matching_credentials_is_ambiguous() {
    let h = Harness::new().await;
    let (ctl1, _api1) = h.add_controller("ctl1").await;
    h.add_region("aws", "eu-west-1", &[&ctl1]).await;
    h.add_credential("alice", "default").await;
    h.add_credential("alice", "backup").await;

    let err = models::create_model(
        &h.state,
        &Context::background(),
        &h.alice(),
        h.create_params("staging"),
    )
    .await
    .expect_err("ambiguous");
    assert_eq!(err.code(), ErrorCode::AmbiguousChoice);
}

#[tokio::test]
async fn explicit_missing_credential_is_not_found_but_empty_selection_proceeds() {
    let h = Harness::new().await;
    let (ctl1, api1) = h.add_controller("ctl1").await;
    h.add_region("aws", "eu-west-1", &[&ctl1]).await;

    // No credentials at all: creation proceeds without one.
    models::create_model(
        &h.state,
        &Context::background(),
        &h.alice(),
        h.create_params("nocred"),
    )
    .await
    .expect("create without credential");
    assert_eq!(api1.credential_updates().len(), 0);

    // Naming a credential that does not exist fails up front.
    let mut params = h.create_params("withcred");
    params.credential = Some(CredentialPath::new("aws", "alice", "missing"));
    let err = models::create_model(&h.state, &Context::background(), &h.alice(), params)
        .await
        .expect_err("missing credential");
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn credential_update_fans_out_and_failed_pushes_stay_flagged() {
    let h = Harness::new().await;
    let (ctl1, api1) = h.add_controller("ctl1").await;
    let (ctl2, api2) = h.add_controller("ctl2").await;
    let cred_path = h.add_credential("alice", "default").await;

    db::credentials::credential_add_controller(&h.state.db, &cred_path, &ctl1)
        .await
        .expect("bind ctl1");
    db::credentials::credential_add_controller(&h.state.db, &cred_path, &ctl2)
        .await
        .expect("bind ctl2");

    // ctl2 is down during the update.
    h.dialer.set_unreachable("ctl2.example:17070");

    let new = NewCredential {
        path: cred_path.clone(),
        auth_type: "userpass".to_string(),
        attributes: HashMap::from([
            ("username".to_string(), "alice".to_string()),
            ("password".to_string(), "rotated".to_string()),
        ]),
        hidden_keys: vec!["password".to_string()],
        revoked: false,
    };
    credentials::update_credential(&h.state, &Context::background(), &h.alice(), new)
        .await
        .expect("update succeeds despite the failed push");

    assert_eq!(api1.credential_updates().len(), 1);
    assert!(api2.credential_updates().is_empty());

    // ctl1 drained its flag; ctl2 still has one pending.
    assert!(
        db::credentials::pending_credential_updates(&h.state.db, &ctl1)
            .await
            .expect("pending")
            .is_empty()
    );
    assert_eq!(
        db::credentials::pending_credential_updates(&h.state.db, &ctl2)
            .await
            .expect("pending"),
        vec![cred_path.to_string()]
    );

    // The controller comes back; the drain path pushes and clears the flag.
    h.dialer.set_reachable("ctl2.example:17070");
    credentials::controller_update_credentials(&h.state, &Context::background(), &ctl2)
        .await
        .expect("drain");
    assert_eq!(api2.credential_updates().len(), 1);
    assert!(
        db::credentials::pending_credential_updates(&h.state.db, &ctl2)
            .await
            .expect("pending")
            .is_empty()
    );
}

#[tokio::test]
async fn revoked_credential_propagates_as_revocation() {
    let h = Harness::new().await;
    let (ctl1, api1) = h.add_controller("ctl1").await;
    let cred_path = h.add_credential("alice", "default").await;
    db::credentials::credential_add_controller(&h.state.db, &cred_path, &ctl1)
        .await
        .expect("bind");

    let new = NewCredential {
        path: cred_path.clone(),
        auth_type: "userpass".to_string(),
        attributes: HashMap::new(),
        hidden_keys: vec![],
        revoked: true,
    };
    credentials::update_credential(&h.state, &Context::background(), &h.alice(), new)
        .await
        .expect("revoke");

    assert_eq!(api1.credential_revocations().len(), 1);
    assert!(api1.credential_updates().is_empty());
}

#[tokio::test]
async fn dying_model_is_reaped_when_controller_says_unauthorized() {
    let h = Harness::new().await;
    let (ctl1, api1) = h.add_controller("ctl1").await;
    h.add_region("aws", "eu-west-1", &[&ctl1]).await;

    let model = models::create_model(
        &h.state,
        &Context::background(),
        &h.alice(),
        h.create_params("staging"),
    )
    .await
    .expect("create");

    models::destroy_model(
        &h.state,
        &Context::background(),
        &h.alice(),
        &common::params::model_tag(&model.uuid),
        None,
    )
    .await
    .expect("destroy");
    let stored = db::models::model_from_uuid(&h.state.db, &model.uuid)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(stored.life, "dying");

    // The upstream model has now disappeared; the controller answers
    // Unauthorized for it.
    api1.fail_model_info(
        &model.uuid,
        ScriptedError::new(ErrorCode::Unauthorized, "unauthorized"),
    );

    let err = models::model_info(
        &h.state,
        &Context::background(),
        &h.alice(),
        &common::params::model_tag(&model.uuid),
        true,
    )
    .await
    .expect_err("unauthorized");
    assert_eq!(err.code(), ErrorCode::Unauthorized);

    assert!(db::models::model_from_uuid(&h.state.db, &model.uuid)
        .await
        .expect("get")
        .is_none());
}

#[tokio::test]
async fn grant_and_revoke_mirror_to_the_controller() {
    let h = Harness::new().await;
    let (ctl1, api1) = h.add_controller("ctl1").await;
    h.add_region("aws", "eu-west-1", &[&ctl1]).await;

    let model = models::create_model(
        &h.state,
        &Context::background(),
        &h.alice(),
        h.create_params("staging"),
    )
    .await
    .expect("create");
    let tag = common::params::model_tag(&model.uuid);

    models::grant_model(&h.state, &Context::background(), &h.alice(), &tag, "bob", "write")
        .await
        .expect("grant");
    let stored = db::models::get_model(&h.state.db, &model.entity_path())
        .await
        .expect("get")
        .expect("row");
    assert!(stored.acl_write.0.contains(&"bob".to_string()));
    assert!(api1
        .grants()
        .iter()
        .any(|(user, access, uuid)| user == "user-bob@external"
            && access == "write"
            && *uuid == model.uuid));

    models::revoke_model(&h.state, &Context::background(), &h.alice(), &tag, "bob", "read")
        .await
        .expect("revoke");
    let stored = db::models::get_model(&h.state.db, &model.entity_path())
        .await
        .expect("get")
        .expect("row");
    assert!(stored.acl_read.0.is_empty());
    assert!(stored.acl_write.0.is_empty());
    assert!(!api1.revokes().is_empty());
}

#[tokio::test]
async fn migrate_reports_one_event_per_spec() {
    let h = Harness::new().await;
    let (ctl1, api1) = h.add_controller("ctl1").await;
    let (_ctl2, _api2) = h.add_controller("ctl2").await;
    h.add_region("aws", "eu-west-1", &[&ctl1]).await;

    let model = models::create_model(
        &h.state,
        &Context::background(),
        &h.alice(),
        h.create_params("staging"),
    )
    .await
    .expect("create");

    let root = Identity {
        username: "root".to_string(),
        admin: true,
    };
    let specs = vec![
        common::api::MigrateModelInfo {
            model_tag: common::params::model_tag(&model.uuid),
            target_controller: "ctl2".to_string(),
        },
        common::api::MigrateModelInfo {
            model_tag: "model-00000000-0000-4000-8000-000000000000".to_string(),
            target_controller: "ctl2".to_string(),
        },
    ];
    let mut events = Vec::new();
    models::migrate_models(
        &h.state,
        &Context::background(),
        &root,
        &specs,
        &mut |event| events.push(event),
    )
    .await
    .expect("migrate");

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].phase, "initiated");
    assert_eq!(events[1].phase, "failed");
    assert_eq!(api1.migrations().len(), 1);

    // The index now points the model at the target controller.
    let stored = db::models::model_from_uuid(&h.state.db, &model.uuid)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(stored.controller_path, "admin/ctl2");
}
