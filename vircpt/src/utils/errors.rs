//! Error types for checkpoint and backup orchestration.

use crate::hypervisor::HypervisorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VircptError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// Per-disk failure during classification. Logged and absorbed there,
    /// never returned past disk-list construction.
    #[error("Unable to resolve disk [{target}]: {reason}")]
    DiskResolution { target: String, reason: String },

    #[error("Failed to start backup: {0}")]
    Submission(String),

    #[error("Backup job already active: {0}")]
    Conflict(String),

    #[error("Failed to abort backup job: {0}")]
    Abort(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Failed to create checkpoint: {0}")]
    CheckpointCreate(String),

    #[error("Filesystem quiesce error: {0}")]
    Quiesce(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Hypervisor error: {0}")]
    Hypervisor(HypervisorError),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<HypervisorError> for VircptError {
    fn from(err: HypervisorError) -> Self {
        match err {
            HypervisorError::Connection(msg) => VircptError::Connection(msg),
            HypervisorError::Xml(msg) => VircptError::Xml(msg),
            other => VircptError::Hypervisor(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, VircptError>;
