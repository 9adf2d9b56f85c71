//! Entity paths, tags and wire error codes.
//!
//! Paths identify entities in the gateway's own namespace (`user/name` for
//! controllers and models, `cloud/user/name` for credentials). Tags are the
//! client-facing encoding carried over the RPC dialect (`model-<uuid>`,
//! `user-<name>@<domain>`, `cloud-<name>`, `cloudcred-...`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error produced when parsing paths or tags from client input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseError {}

/// A `user/name` pair naming a controller or a model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityPath {
    pub user: String,
    pub name: String,
}

impl EntityPath {
    pub fn new(user: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.name)
    }
}

impl FromStr for EntityPath {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(user), Some(name), None) if !user.is_empty() && !name.is_empty() => {
                Ok(EntityPath::new(user, name))
            }
            _ => Err(ParseError(format!(
                "wrong number of parts in entity path {s:?}"
            ))),
        }
    }
}

/// A `cloud/user/name` triple naming a cloud credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialPath {
    pub cloud: String,
    pub user: String,
    pub name: String,
}

impl CredentialPath {
    pub fn new(
        cloud: impl Into<String>,
        user: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cloud: cloud.into(),
            user: user.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CredentialPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cloud, self.user, self.name)
    }
}

impl FromStr for CredentialPath {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(cloud), Some(user), Some(name), None)
                if !cloud.is_empty() && !user.is_empty() && !name.is_empty() =>
            {
                Ok(CredentialPath::new(cloud, user, name))
            }
            _ => Err(ParseError(format!(
                "wrong number of parts in credential path {s:?}"
            ))),
        }
    }
}

/// The canonical external identity domain. Domain-less user tags are
/// rewritten into this domain; users local to a backend controller are
/// rejected.
pub const EXTERNAL_DOMAIN: &str = "external";

/// Formats a gateway username as a client-facing user tag, adding the
/// external domain when the name carries none.
pub fn user_tag(username: &str) -> String {
    if username.contains('@') {
        format!("user-{username}")
    } else {
        format!("user-{username}@{EXTERNAL_DOMAIN}")
    }
}

/// Parses a user tag into a gateway username. Tags in the external domain
/// lose the domain suffix; tags in any other domain keep it; domain-less
/// tags name controller-local users and are refused.
pub fn parse_user_tag(tag: &str) -> Result<String, ParseError> {
    let name = tag
        .strip_prefix("user-")
        .ok_or_else(|| ParseError(format!("{tag:?} is not a valid user tag")))?;
    if name.is_empty() {
        return Err(ParseError(format!("{tag:?} is not a valid user tag")));
    }
    match name.split_once('@') {
        None => Err(ParseError("unsupported local user".to_string())),
        Some((user, EXTERNAL_DOMAIN)) => Ok(user.to_string()),
        Some(_) => Ok(name.to_string()),
    }
}

/// Formats a model UUID as a model tag.
pub fn model_tag(uuid: &str) -> String {
    format!("model-{uuid}")
}

/// Parses a `model-<UUID>` tag, returning the embedded UUID.
pub fn parse_model_tag(tag: &str) -> Result<Uuid, ParseError> {
    tag.strip_prefix("model-")
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| ParseError(format!("{tag} is not a valid model tag")))
}

pub fn cloud_tag(cloud: &str) -> String {
    format!("cloud-{cloud}")
}

pub fn parse_cloud_tag(tag: &str) -> Result<String, ParseError> {
    match tag.strip_prefix("cloud-") {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(ParseError(format!("{tag:?} is not a valid cloud tag"))),
    }
}

/// Formats a credential path as a `cloudcred-` tag. The embedded user is
/// rendered with its external domain so the target controller sees the same
/// identity the gateway authenticated.
pub fn cloud_credential_tag(path: &CredentialPath) -> String {
    let user = if path.user.contains('@') {
        path.user.clone()
    } else {
        format!("{}@{EXTERNAL_DOMAIN}", path.user)
    };
    format!("cloudcred-{}_{}_{}", path.cloud, user, path.name)
}

pub fn parse_cloud_credential_tag(tag: &str) -> Result<CredentialPath, ParseError> {
    let raw = tag
        .strip_prefix("cloudcred-")
        .ok_or_else(|| ParseError(format!("{tag:?} is not a valid cloud credential tag")))?;
    let mut parts = raw.split('_');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(cloud), Some(user), Some(name), None)
            if !cloud.is_empty() && !user.is_empty() && !name.is_empty() =>
        {
            let user = user
                .strip_suffix(&format!("@{EXTERNAL_DOMAIN}"))
                .unwrap_or(user);
            Ok(CredentialPath::new(cloud, user, name))
        }
        _ => Err(ParseError(format!(
            "{tag:?} is not a valid cloud credential tag"
        ))),
    }
}

/// Machine-readable error kinds carried on the wire and matched by callers.
/// The wire encoding is [`ErrorCode::as_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    BadRequest,
    Unauthorized,
    Forbidden,
    AmbiguousChoice,
    NotImplemented,
    NotSupported,
    UpgradeInProgress,
    ServerConfiguration,
    ApiConnection,
    InvalidModelParams,
    MonitoringStopped,
    BadId,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not found",
            ErrorCode::AlreadyExists => "already exists",
            ErrorCode::BadRequest => "bad request",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::AmbiguousChoice => "ambiguous choice",
            ErrorCode::NotImplemented => "not implemented",
            ErrorCode::NotSupported => "not supported",
            ErrorCode::UpgradeInProgress => "upgrade in progress",
            ErrorCode::ServerConfiguration => "server configuration",
            ErrorCode::ApiConnection => "cannot connect to API",
            ErrorCode::InvalidModelParams => "invalid model params",
            ErrorCode::MonitoringStopped => "monitoring stopped",
            ErrorCode::BadId => "bad id",
            ErrorCode::Internal => "internal error",
        }
    }

    pub fn from_wire(code: &str) -> Option<ErrorCode> {
        let code = match code {
            "not found" => ErrorCode::NotFound,
            "already exists" => ErrorCode::AlreadyExists,
            "bad request" => ErrorCode::BadRequest,
            "unauthorized" => ErrorCode::Unauthorized,
            "forbidden" => ErrorCode::Forbidden,
            "ambiguous choice" => ErrorCode::AmbiguousChoice,
            "not implemented" => ErrorCode::NotImplemented,
            "not supported" => ErrorCode::NotSupported,
            "upgrade in progress" => ErrorCode::UpgradeInProgress,
            "server configuration" => ErrorCode::ServerConfiguration,
            "cannot connect to API" => ErrorCode::ApiConnection,
            "invalid model params" => ErrorCode::InvalidModelParams,
            "monitoring stopped" => ErrorCode::MonitoringStopped,
            "bad id" => ErrorCode::BadId,
            "internal error" => ErrorCode::Internal,
            _ => return None,
        };
        Some(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_path_round_trips() {
        let path: EntityPath = "alice/staging".parse().expect("parse");
        assert_eq!(path.user, "alice");
        assert_eq!(path.name, "staging");
        assert_eq!(path.to_string(), "alice/staging");
    }

    #[test]
    fn entity_path_rejects_wrong_shapes() {
        for bad in ["alice", "alice/staging/extra", "/staging", "alice/", ""] {
            let err = bad.parse::<EntityPath>().expect_err("should fail");
            assert!(
                err.to_string().contains("wrong number of parts"),
                "{bad}: {err}"
            );
        }
    }

    #[test]
    fn credential_path_round_trips() {
        let path: CredentialPath = "aws/alice/default".parse().expect("parse");
        assert_eq!(path.cloud, "aws");
        assert_eq!(path.to_string(), "aws/alice/default");
    }

    #[test]
    fn user_tag_adds_external_domain() {
        assert_eq!(user_tag("alice"), "user-alice@external");
        assert_eq!(user_tag("bob@candid"), "user-bob@candid");
    }

    #[test]
    fn parse_user_tag_strips_external_domain() {
        assert_eq!(parse_user_tag("user-alice@external").unwrap(), "alice");
        assert_eq!(parse_user_tag("user-bob@candid").unwrap(), "bob@candid");
    }

    #[test]
    fn parse_user_tag_rejects_local_users() {
        let err = parse_user_tag("user-admin").expect_err("local user");
        assert_eq!(err.to_string(), "unsupported local user");
    }

    #[test]
    fn model_tag_parse_rejects_garbage() {
        let err = parse_model_tag("badtag").expect_err("invalid tag");
        assert_eq!(err.to_string(), "badtag is not a valid model tag");
        let err = parse_model_tag("model-not-a-uuid").expect_err("invalid uuid");
        assert!(err.to_string().ends_with("is not a valid model tag"));
    }

    #[test]
    fn model_tag_round_trips() {
        let id = Uuid::new_v4();
        let tag = model_tag(&id.to_string());
        assert_eq!(parse_model_tag(&tag).unwrap(), id);
    }

    #[test]
    fn cloud_credential_tag_round_trips() {
        let path = CredentialPath::new("aws", "alice", "default");
        let tag = cloud_credential_tag(&path);
        assert_eq!(tag, "cloudcred-aws_alice@external_default");
        assert_eq!(parse_cloud_credential_tag(&tag).unwrap(), path);
    }

    #[test]
    fn error_code_wire_round_trips() {
        for code in [
            ErrorCode::NotFound,
            ErrorCode::AlreadyExists,
            ErrorCode::BadRequest,
            ErrorCode::Unauthorized,
            ErrorCode::Forbidden,
            ErrorCode::AmbiguousChoice,
            ErrorCode::NotImplemented,
            ErrorCode::NotSupported,
            ErrorCode::UpgradeInProgress,
            ErrorCode::ServerConfiguration,
            ErrorCode::ApiConnection,
            ErrorCode::InvalidModelParams,
            ErrorCode::MonitoringStopped,
            ErrorCode::BadId,
        ] {
            assert_eq!(ErrorCode::from_wire(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::from_wire("no such code"), None);
    }
}
