//! ACL predicates applied to index entities.
//!
//! Absence of an entity combined with a failed identity check must surface
//! as `Unauthorized`, never `NotFound`, so callers cannot probe for the
//! existence of entities in other users' namespaces.

use crate::auth::Identity;
use crate::error::{Error, Result};
use crate::persistence::{CloudRegionRecord, ControllerRecord, CredentialRecord, ModelRecord};

/// An entity with an owner and ACL sets.
pub trait AclEntity {
    fn owner(&self) -> &str;
    fn read_set(&self) -> &[String];
    fn write_set(&self) -> &[String] {
        &[]
    }
    fn admin_set(&self) -> &[String] {
        &[]
    }
    /// Entities readable by everyone (public controllers).
    fn world_readable(&self) -> bool {
        false
    }
}

impl AclEntity for ModelRecord {
    fn owner(&self) -> &str {
        let (user, _) = self.path.split_once('/').unwrap_or((self.path.as_str(), ""));
        user
    }

    fn read_set(&self) -> &[String] {
        &self.acl_read.0
    }

    fn write_set(&self) -> &[String] {
        &self.acl_write.0
    }

    fn admin_set(&self) -> &[String] {
        &self.acl_admin.0
    }
}

impl AclEntity for ControllerRecord {
    fn owner(&self) -> &str {
        let (user, _) = self.path.split_once('/').unwrap_or((self.path.as_str(), ""));
        user
    }

    fn read_set(&self) -> &[String] {
        &[]
    }

    fn world_readable(&self) -> bool {
        self.public
    }
}

impl AclEntity for CloudRegionRecord {
    fn owner(&self) -> &str {
        ""
    }

    fn read_set(&self) -> &[String] {
        &self.acl_read.0
    }

    fn admin_set(&self) -> &[String] {
        &self.acl_admin.0
    }

    /// A cloud with an empty read ACL is open to every authenticated user.
    fn world_readable(&self) -> bool {
        self.acl_read.0.is_empty()
    }
}

impl AclEntity for CredentialRecord {
    fn owner(&self) -> &str {
        &self.owner
    }

    fn read_set(&self) -> &[String] {
        &[]
    }
}

fn contains(set: &[String], user: &str) -> bool {
    set.iter().any(|u| u == user || u == "everyone")
}

/// Returns whether the identity may read the entity, without constructing
/// an error. Admins implicitly have read everywhere.
pub fn can_read(identity: &Identity, entity: &dyn AclEntity) -> bool {
    identity.admin
        || entity.world_readable()
        || entity.owner() == identity.username
        || contains(entity.read_set(), &identity.username)
        || contains(entity.admin_set(), &identity.username)
}

pub fn check_can_read(identity: &Identity, entity: &dyn AclEntity) -> Result<()> {
    if can_read(identity, entity) {
        return Ok(());
    }
    Err(Error::unauthorized("unauthorized"))
}

pub fn check_can_write(identity: &Identity, entity: &dyn AclEntity) -> Result<()> {
    if identity.admin
        || entity.owner() == identity.username
        || contains(entity.write_set(), &identity.username)
        || contains(entity.admin_set(), &identity.username)
    {
        return Ok(());
    }
    Err(Error::unauthorized("unauthorized"))
}

pub fn check_is_admin(identity: &Identity, entity: &dyn AclEntity) -> Result<()> {
    if identity.admin
        || entity.owner() == identity.username
        || contains(entity.admin_set(), &identity.username)
    {
        return Ok(());
    }
    Err(Error::unauthorized("unauthorized"))
}

/// Checks the identity against an explicit ACL list.
pub fn check_acl(identity: &Identity, acl: &[String]) -> Result<()> {
    if identity.admin || contains(acl, &identity.username) {
        return Ok(());
    }
    Err(Error::unauthorized("unauthorized"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sqlx::types::Json;

    fn identity(name: &str, admin: bool) -> Identity {
        Identity {
            username: name.to_string(),
            admin,
        }
    }

    fn model(owner: &str, read: &[&str]) -> ModelRecord {
        ModelRecord {
            path: format!("{owner}/m"),
            controller_path: "admin/ctl".to_string(),
            uuid: "uuid-1".to_string(),
            cloud: "aws".to_string(),
            cloud_region: String::new(),
            credential_path: None,
            default_series: None,
            model_type: None,
            provider_type: None,
            life: "alive".to_string(),
            status: None,
            status_message: None,
            status_since: None,
            agent_version: None,
            creator: owner.to_string(),
            usage_sender_credentials: None,
            acl_read: Json(read.iter().map(|s| s.to_string()).collect()),
            acl_write: Json(vec![]),
            acl_admin: Json(vec![]),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn owner_and_reader_can_read() {
        let m = model("alice", &["bob"]);
        assert!(can_read(&identity("alice", false), &m));
        assert!(can_read(&identity("bob", false), &m));
        assert!(!can_read(&identity("carol", false), &m));
    }

    #[test]
    fn admin_reads_implicitly() {
        let m = model("alice", &[]);
        assert!(can_read(&identity("root", true), &m));
        check_is_admin(&identity("root", true), &m).expect("admin");
    }

    #[test]
    fn failed_check_is_unauthorized() {
        let m = model("alice", &[]);
        let err = check_can_read(&identity("carol", false), &m).expect_err("denied");
        assert_eq!(err.code(), crate::error::ErrorCode::Unauthorized);
    }

    #[test]
    fn everyone_entry_opens_read() {
        let m = model("alice", &["everyone"]);
        assert!(can_read(&identity("carol", false), &m));
    }
}
