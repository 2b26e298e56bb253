//! Core domain types and traits for the Hangar CI service.
//!
//! This crate contains:
//! - Resource identifiers and common types
//! - Jobs, builds, projects and the status rules tying them together
//! - Capability traits for capacity providers and source hosts
//! - Credential storage abstraction
//! - Read-model snapshots and build listing filters

pub mod build;
pub mod capacity;
pub mod credential;
pub mod error;
pub mod host;
pub mod id;
pub mod job;
pub mod project;
pub mod query;
pub mod snapshot;

pub use error::{Error, Result};
pub use id::{ResourceId, UnitId};
