use sqlx::SqlitePool;

pub mod audit;
pub mod clouds;
pub mod controllers;
pub mod credentials;
pub mod inventory;
pub mod migrations;
pub mod models;
pub mod readiter;

pub type Db = SqlitePool;

pub use audit::{AuditEntry, AuditRecord};
pub use clouds::{CloudRegionRecord, NewCloudRegion};
pub use controllers::{ControllerRecord, LeaseOutcome, NewController};
pub use credentials::{CredentialRecord, NewCredential};
pub use inventory::{ApplicationRecord, MachineRecord};
pub use models::{ModelRecord, ModelReconcile, NewModel};
pub use readiter::CanReadIter;

use crate::error::Error;

/// Maps a backend unique-constraint failure to `AlreadyExists`, leaving
/// every other database error internal with its cause preserved.
pub(crate) fn insert_error(err: sqlx::Error, what: &str) -> Error {
    if let sqlx::Error::Database(dbe) = &err {
        if matches!(dbe.kind(), sqlx::error::ErrorKind::UniqueViolation) {
            return Error::already_exists(format!("{what} already exists"));
        }
    }
    err.into()
}
