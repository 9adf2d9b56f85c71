use std::collections::HashMap;
use std::sync::Arc;

use subtle::ConstantTimeEq;

use common::params::{parse_user_tag, EXTERNAL_DOMAIN};

use crate::error::{Error, Result};

/// The authenticated principal attached to a connection after login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Canonical username, without the implicit external domain.
    pub username: String,
    /// True when the user is in the configured controller-admin set.
    pub admin: bool,
}

impl Identity {
    pub fn tag(&self) -> String {
        common::params::user_tag(&self.username)
    }
}

/// Validates login credentials for a username. The production implementation
/// is backed by the configured static user set; deployments fronted by an
/// external identity service plug in their own.
pub trait CredentialChecker: Send + Sync {
    fn check(&self, username: &str, credentials: &str) -> bool;
}

/// Static `name=token` pairs from configuration, compared in constant time.
pub struct StaticCredentialChecker {
    tokens: HashMap<String, String>,
}

impl StaticCredentialChecker {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

impl CredentialChecker for StaticCredentialChecker {
    fn check(&self, username: &str, credentials: &str) -> bool {
        let Some(expected) = self.tokens.get(username) else {
            return false;
        };
        if expected.len() != credentials.len() {
            return false;
        }
        expected.as_bytes().ct_eq(credentials.as_bytes()).into()
    }
}

/// Resolves incoming credentials to an [`Identity`] and answers identity
/// checks for it.
#[derive(Clone)]
pub struct Authenticator {
    controller_admin: String,
    checker: Arc<dyn CredentialChecker>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("controller_admin", &self.controller_admin)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(controller_admin: String, checker: Arc<dyn CredentialChecker>) -> Result<Self> {
        if controller_admin.is_empty() {
            return Err(Error::server_configuration(
                "no controller admin group specified",
            ));
        }
        Ok(Self {
            controller_admin,
            checker,
        })
    }

    pub fn controller_admin(&self) -> &str {
        &self.controller_admin
    }

    /// Resolves a login request to an identity. The auth tag must name an
    /// external user; users local to a backend controller are refused.
    pub fn login(&self, auth_tag: &str, credentials: &str) -> Result<Identity> {
        let username = parse_user_tag(auth_tag).map_err(|err| {
            if err.to_string() == "unsupported local user" {
                Error::bad_request("unsupported local user")
            } else {
                Error::bad_request(err.to_string())
            }
        })?;
        if !self.checker.check(&username, credentials) {
            return Err(Error::unauthorized("invalid entity name or password"));
        }
        let admin = self.is_controller_admin(&username);
        Ok(Identity { username, admin })
    }

    fn is_controller_admin(&self, username: &str) -> bool {
        username == self.controller_admin
            || username
                .strip_suffix(&format!("@{EXTERNAL_DOMAIN}"))
                .is_some_and(|u| u == self.controller_admin)
    }

    /// Checks that the identity is exactly the named user (or an admin,
    /// which passes every identity check).
    pub fn check_is_user(&self, identity: &Identity, user: &str) -> Result<()> {
        if identity.admin || identity.username == user {
            return Ok(());
        }
        Err(Error::unauthorized("unauthorized"))
    }

    pub fn check_is_admin(&self, identity: &Identity) -> Result<()> {
        if identity.admin {
            return Ok(());
        }
        Err(Error::unauthorized("unauthorized"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> Authenticator {
        let checker = StaticCredentialChecker::new(HashMap::from([
            ("alice".to_string(), "alice-token".to_string()),
            ("root".to_string(), "root-token".to_string()),
        ]));
        Authenticator::new("root".to_string(), Arc::new(checker)).expect("authenticator")
    }

    #[test]
    fn requires_controller_admin_configuration() {
        let checker = StaticCredentialChecker::new(HashMap::new());
        let err = Authenticator::new(String::new(), Arc::new(checker)).expect_err("missing admin");
        assert_eq!(err.code(), crate::error::ErrorCode::ServerConfiguration);
    }

    #[test]
    fn login_accepts_external_users() {
        let auth = authenticator();
        let identity = auth
            .login("user-alice@external", "alice-token")
            .expect("login");
        assert_eq!(identity.username, "alice");
        assert!(!identity.admin);
    }

    #[test]
    fn login_rejects_local_users_as_bad_request() {
        let auth = authenticator();
        let err = auth.login("user-alice", "alice-token").expect_err("local user");
        assert_eq!(err.code(), crate::error::ErrorCode::BadRequest);
        assert_eq!(err.to_string(), "unsupported local user");
    }

    #[test]
    fn login_rejects_bad_credentials() {
        let auth = authenticator();
        let err = auth
            .login("user-alice@external", "wrong")
            .expect_err("bad token");
        assert_eq!(err.code(), crate::error::ErrorCode::Unauthorized);
    }

    #[test]
    fn controller_admin_passes_identity_checks() {
        let auth = authenticator();
        let root = auth.login("user-root@external", "root-token").expect("login");
        assert!(root.admin);
        auth.check_is_user(&root, "anyone").expect("admin may act for anyone");

        let alice = auth
            .login("user-alice@external", "alice-token")
            .expect("login");
        auth.check_is_user(&alice, "alice").expect("self");
        let err = auth.check_is_user(&alice, "bob").expect_err("not bob");
        assert_eq!(err.code(), crate::error::ErrorCode::Unauthorized);
    }
}
