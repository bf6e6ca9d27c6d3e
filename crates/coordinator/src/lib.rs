//! Exclusive access to a user's shared MLS state, across tasks and across
//! processes.
//!
//! Two layers compose here. [`UserCoordinator`] serializes tasks of *this*
//! process per user; [`ProcessCoordinator`] holds a kernel advisory lock
//! against the *other* process. [`AccessCoordinator::with_exclusive`] is the
//! only supported way to combine them: permit first, advisory lock second,
//! released in reverse on every exit path.

mod process;
mod scope;
mod user;

pub use process::{AdvisoryLockGuard, ProcessCoordinator};
pub use scope::{AccessCoordinator, ExclusiveAccess, Purpose};
pub use user::{OperationPermit, UserCoordinator};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cross-process lock is busy for {0}")]
    LockBusy(String),
    #[error("timed out waiting for the per-user permit of {0}")]
    PermitTimeout(String),
    #[error("timed out waiting for the cross-process advisory lock of {0}")]
    AdvisoryLockTimeout(String),
    #[error("operation was cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
