//! Shared wire types for the gatehouse workspace.
//!
//! Keep cross-crate types here: the RPC envelope, entity paths and tags, and
//! the facade parameter DTOs spoken by both the server and the CLI.

pub mod api;
pub mod params;
