//! Scheduler error types.

use hangar_core::capacity::ProviderError;
use hangar_core::host::HostError;
use hangar_core::{ResourceId, UnitId};
use hangar_db::DbError;
use thiserror::Error;

/// Why a pool could not grow, shrink or reconcile.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("provider still failing after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },

    #[error("provider rejected request: {0}")]
    Permanent(String),

    #[error("provider credential expired: {0}")]
    AuthExpired(String),

    /// Backpressure, not a fault.
    #[error("pool {0} is at capacity")]
    CapacityExhausted(String),

    #[error("unit {0} still has jobs")]
    Busy(UnitId),

    #[error("unknown unit {0}")]
    UnknownUnit(UnitId),
}

impl From<ProviderError> for AllocationError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(message) => AllocationError::Transient {
                attempts: 1,
                message,
            },
            ProviderError::Permanent(message) => AllocationError::Permanent(message),
            ProviderError::AuthExpired(message) => AllocationError::AuthExpired(message),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Domain(#[from] hangar_core::Error),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Host(#[from] HostError),

    /// Gave up after repeated version conflicts.
    #[error("too many concurrent updates to {0}")]
    Contention(ResourceId),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
