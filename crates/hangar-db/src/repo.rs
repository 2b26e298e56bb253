//! Repository traits and implementations.

pub mod build;
pub mod credential;
pub mod job;
pub mod project;

pub use build::{BuildRepo, PgBuildRepo};
pub use credential::PgCredentialStore;
pub use job::{JobRepo, PgJobRepo};
pub use project::{PgProjectRepo, ProjectRepo};
