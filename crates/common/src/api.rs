//! Shared API DTOs used across the gatehouse server and the ghctl CLI.
//!
//! The RPC dialect is a stream of length-prefixed JSON frames. Requests name
//! a facade, a facade version and a method; responses either carry a result
//! payload or an error with a machine-readable code.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::params::ErrorCode;

/// A single RPC request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(rename = "request-id")]
    pub request_id: u64,
    /// Facade name ("Admin", "ModelManager", ...).
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u16,
    /// Sub-object id; empty for facades without sub-objects.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Method name on the facade.
    pub request: String,
    #[serde(default)]
    pub params: Value,
}

/// A single RPC response frame. Exactly one of `response` and `error` is
/// populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(rename = "request-id")]
    pub request_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(
        rename = "error-code",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub error_code: Option<String>,
}

impl RpcResponse {
    pub fn result(request_id: u64, response: Value) -> Self {
        Self {
            request_id,
            response: Some(response),
            error: None,
            error_code: None,
        }
    }

    pub fn error(request_id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            request_id,
            response: None,
            error: Some(message.into()),
            error_code: Some(code.as_str().to_string()),
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        self.error_code.as_deref().and_then(ErrorCode::from_wire)
    }
}

/// Supported versions advertised for one facade in the login result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacadeVersions {
    pub name: String,
    pub versions: Vec<u16>,
}

/// Admin.Login request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Tag of the authenticating user (`user-<name>@<domain>`).
    #[serde(rename = "auth-tag")]
    pub auth_tag: String,
    /// Bearer credential for the user.
    pub credentials: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResult {
    #[serde(rename = "user-info")]
    pub user_info: AuthUserInfo,
    #[serde(rename = "controller-tag")]
    pub controller_tag: String,
    #[serde(rename = "server-version")]
    pub server_version: String,
    pub facades: Vec<FacadeVersions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUserInfo {
    pub identity: String,
    #[serde(rename = "controller-access")]
    pub controller_access: String,
}

/// Entity reference by tag, used by bulk-call params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entities {
    pub entities: Vec<Entity>,
}

/// Per-entity error payload in bulk results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.as_str().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResults {
    pub results: Vec<ErrorResult>,
}

/// Life of a model as reported by its controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    Alive,
    Dying,
    Dead,
}

impl Life {
    pub fn as_str(&self) -> &'static str {
        match self {
            Life::Alive => "alive",
            Life::Dying => "dying",
            Life::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub info: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

/// Model description returned by ModelManager.ModelInfo and friends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub uuid: String,
    #[serde(rename = "controller-uuid")]
    pub controller_uuid: String,
    #[serde(rename = "provider-type", default)]
    pub provider_type: String,
    #[serde(rename = "default-series", default)]
    pub default_series: String,
    #[serde(rename = "cloud-tag")]
    pub cloud_tag: String,
    #[serde(rename = "cloud-region", default)]
    pub cloud_region: String,
    #[serde(
        rename = "cloud-credential-tag",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub cloud_credential_tag: String,
    #[serde(rename = "owner-tag")]
    pub owner_tag: String,
    pub life: Life,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub users: Vec<ModelUserInfo>,
    #[serde(default)]
    pub machines: Vec<ModelMachineInfo>,
    #[serde(
        rename = "agent-version",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub agent_version: Option<String>,
    #[serde(rename = "type", default)]
    pub model_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUserInfo {
    #[serde(rename = "user")]
    pub user_name: String,
    #[serde(rename = "display-name", default)]
    pub display_name: String,
    pub access: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMachineInfo {
    pub id: String,
    #[serde(rename = "instance-id", default)]
    pub instance_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "has-vote", default)]
    pub has_vote: bool,
    #[serde(rename = "wants-vote", default)]
    pub wants_vote: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<MachineHardware>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineHardware {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u64>,
    #[serde(
        rename = "availability-zone",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub availability_zone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfoResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ModelInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfoResults {
    pub results: Vec<ModelInfoResult>,
}

/// Compact model listing entry (ModelManager.ListModels).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserModel {
    pub name: String,
    pub uuid: String,
    #[serde(rename = "type", default)]
    pub model_type: String,
    #[serde(rename = "owner-tag")]
    pub owner_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserModelList {
    #[serde(rename = "user-models")]
    pub user_models: Vec<UserModel>,
}

/// ModelManager.CreateModel parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCreateArgs {
    pub name: String,
    #[serde(rename = "owner-tag")]
    pub owner_tag: String,
    #[serde(rename = "cloud-tag", default, skip_serializing_if = "String::is_empty")]
    pub cloud_tag: String,
    #[serde(rename = "region", default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(
        rename = "credential",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub credential_tag: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config: HashMap<String, Value>,
}

/// ModelManager.DestroyModels (v4+) parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyModelsParams {
    pub models: Vec<DestroyModelParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyModelParams {
    #[serde(rename = "model-tag")]
    pub model_tag: String,
    #[serde(
        rename = "destroy-storage",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub destroy_storage: Option<bool>,
}

/// ModelManager.ModifyModelAccess parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyModelAccessRequest {
    pub changes: Vec<ModifyModelAccess>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyModelAccess {
    #[serde(rename = "user-tag")]
    pub user_tag: String,
    pub action: AccessAction,
    pub access: String,
    #[serde(rename = "model-tag")]
    pub model_tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessAction {
    Grant,
    Revoke,
}

/// Cloud description (Cloud.Cloud / Cloud.Clouds).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudInfo {
    #[serde(rename = "type")]
    pub provider_type: String,
    #[serde(rename = "auth-types", default)]
    pub auth_types: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    #[serde(
        rename = "identity-endpoint",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub identity_endpoint: String,
    #[serde(
        rename = "storage-endpoint",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub storage_endpoint: String,
    #[serde(default)]
    pub regions: Vec<CloudRegionInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudRegionInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudsResult {
    pub clouds: HashMap<String, CloudInfo>,
}

/// Redacted or full credential content (Cloud.CredentialContents).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialContent {
    pub name: String,
    pub cloud: String,
    #[serde(rename = "auth-type")]
    pub auth_type: String,
    #[serde(default)]
    pub attrs: HashMap<String, String>,
    /// Names of secret attributes withheld from this caller.
    #[serde(rename = "redacted", default, skip_serializing_if = "Vec::is_empty")]
    pub redacted: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialContentResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CredentialContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialContentResults {
    pub results: Vec<CredentialContentResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialContentsParams {
    #[serde(default)]
    pub credentials: Vec<CredentialContentId>,
    /// Include secret attribute values. Only the owner may see them.
    #[serde(rename = "include-secrets", default)]
    pub include_secrets: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialContentId {
    #[serde(rename = "cloud-name")]
    pub cloud: String,
    #[serde(rename = "credential-name")]
    pub name: String,
    /// Owner of the credential; empty means the caller's own.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,
}

/// Cloud.UpdateCredentials parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCredentialsParams {
    pub credentials: Vec<TaggedCredential>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedCredential {
    pub tag: String,
    pub credential: CloudCredentialArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudCredentialArgs {
    #[serde(rename = "auth-type")]
    pub auth_type: String,
    #[serde(default)]
    pub attrs: HashMap<String, String>,
}

/// Controller description (Gatehouse.ListControllers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub path: String,
    pub uuid: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(
        rename = "agent-version",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub agent_version: Option<String>,
    #[serde(
        rename = "unavailable-since",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub unavailable_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerInfoList {
    pub controllers: Vec<ControllerInfo>,
}

/// Gatehouse.AddController parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddControllerRequest {
    /// Path of the new controller (`user/name`).
    pub path: String,
    /// API endpoints, `host:port`.
    pub hosts: Vec<String>,
    #[serde(rename = "ca-cert", default, skip_serializing_if = "String::is_empty")]
    pub ca_cert: String,
    #[serde(rename = "admin-user")]
    pub admin_user: String,
    #[serde(rename = "admin-password")]
    pub admin_password: String,
    #[serde(default)]
    pub public: bool,
}

/// One model to migrate and where to (Gatehouse.MigrateModel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateModelInfo {
    #[serde(rename = "model-tag")]
    pub model_tag: String,
    #[serde(rename = "target-controller")]
    pub target_controller: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateModelRequest {
    pub specs: Vec<MigrateModelInfo>,
}

/// Progress event emitted for each model while a migration runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationEvent {
    #[serde(rename = "model-tag")]
    pub model_tag: String,
    #[serde(rename = "target-controller")]
    pub target_controller: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationEvents {
    pub events: Vec<MigrationEvent>,
}

/// Gatehouse.GrantAuditLogAccess parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogAccessRequest {
    #[serde(rename = "user-tag")]
    pub user_tag: String,
}

/// One page of a model summary watcher (ModelSummaryWatcher.Next).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryWatcherNextResults {
    pub models: Vec<ModelAbstract>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAbstract {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub cloud: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub status: String,
}

/// Result of allocating a watcher (Controller.WatchModelSummaries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryWatcherId {
    #[serde(rename = "watcher-id")]
    pub watcher_id: String,
}

/// UserManager.UserInfo result for the authenticated principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    #[serde(rename = "display-name", default)]
    pub display_name: String,
    #[serde(default)]
    pub access: String,
    #[serde(rename = "date-created")]
    pub date_created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfoResults {
    pub results: Vec<UserInfoResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfoResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<UserInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_round_trips() {
        let req = RpcRequest {
            request_id: 7,
            kind: "ModelManager".to_string(),
            version: 5,
            id: String::new(),
            request: "ListModels".to_string(),
            params: serde_json::json!({"tag": "user-alice@external"}),
        };
        let raw = serde_json::to_string(&req).expect("serialize");
        assert!(raw.contains("\"request-id\":7"));
        assert!(!raw.contains("\"id\""));
        let back: RpcRequest = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back.kind, "ModelManager");
        assert_eq!(back.version, 5);
    }

    #[test]
    fn response_error_exposes_code() {
        let resp = RpcResponse::error(3, ErrorCode::NotSupported, "old client");
        assert_eq!(resp.code(), Some(ErrorCode::NotSupported));
        let raw = serde_json::to_string(&resp).expect("serialize");
        assert!(raw.contains("\"error-code\":\"not supported\""));
        assert!(!raw.contains("\"response\""));
    }

    #[test]
    fn login_result_round_trips() {
        let result = LoginResult {
            user_info: AuthUserInfo {
                identity: "user-alice@external".to_string(),
                controller_access: "login".to_string(),
            },
            controller_tag: "controller-deadbeef".to_string(),
            server_version: "2.9.33".to_string(),
            facades: vec![FacadeVersions {
                name: "ModelManager".to_string(),
                versions: vec![2, 3, 4, 5],
            }],
        };
        let raw = serde_json::to_value(&result).expect("serialize");
        let back: LoginResult = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(back.facades[0].versions, vec![2, 3, 4, 5]);
    }
}
