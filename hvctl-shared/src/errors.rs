//! Error type for every hvctl operation.
//!
//! Variants are grouped by who is at fault:
//! - caller preconditions (`NotFound`, `InvalidArgument`, `AlreadyExists`)
//! - session acquisition (`Session`)
//! - faults reported by the hypervisor itself (`Hypervisor`, `Timeout`)
//! - local failures (`Storage`, `Config`, `Io`, `Internal`)

use thiserror::Error;

/// Result alias used throughout hvctl.
pub type HvctlResult<T> = Result<T, HvctlError>;

#[derive(Debug, Error)]
pub enum HvctlError {
    /// The named machine, medium or attachment does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An argument is outside the accepted set (e.g. an OS kind that is not allowlisted).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A resource with the same identity is already present.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The resource is in a state that does not permit the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A session could not be locked onto the machine.
    ///
    /// Fatal for the operation that requested it: nothing can be mutated without a session.
    #[error("session error: {0}")]
    Session(String),

    /// The hypervisor rejected or failed an operation.
    #[error("hypervisor fault: {0}")]
    Hypervisor(String),

    /// A bounded wait on a progress object expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Settings directory or media file layout problem.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid handler configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The active hypervisor backend cannot perform the operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HvctlError {
    /// Returns true if the hypervisor reported this error (as opposed to a caller
    /// precondition or a local failure).
    pub fn is_hypervisor_fault(&self) -> bool {
        matches!(self, Self::Hypervisor(_) | Self::Timeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
