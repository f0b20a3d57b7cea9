//! Hypervisor collaborator contracts.
//!
//! Everything the orchestrator needs from the hypervisor goes through the
//! [`Hypervisor`] and [`Quiesce`] traits. Failures come back as explicit
//! [`HypervisorError`] values; there is no global error handler.
//!
//! Two implementations ship with the crate:
//! - [`VirshHypervisor`] drives a libvirt daemon through the `virsh` client
//! - [`MockHypervisor`] keeps domains and checkpoints in memory

pub mod mock;
pub mod virsh;

use crate::checkpoint::{Checkpoint, CheckpointRequest};
use crate::export::ExportRequest;
use async_trait::async_trait;
use thiserror::Error;

pub use mock::MockHypervisor;
pub use virsh::VirshHypervisor;

/// Errors reported by a hypervisor binding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("cannot reach hypervisor: {0}")]
    Connection(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Another job holds the resource (e.g. a block job on the disk)
    #[error("resource busy: {0}")]
    Busy(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("{command} failed: {message}")]
    Command { command: String, message: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("malformed document: {0}")]
    Xml(String),
}

impl From<std::io::Error> for HypervisorError {
    fn from(err: std::io::Error) -> Self {
        HypervisorError::Io(err.to_string())
    }
}

/// Opaque handle to a virtual machine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Domain {
    name: String,
}

impl Domain {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Type of a running block job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockJobKind {
    Pull,
    Copy,
    Commit,
    ActiveCommit,
    Backup,
    Unknown(String),
}

/// Status of a block job on one disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockJobInfo {
    pub kind: BlockJobKind,
    /// Completion percentage, if the hypervisor reports it
    pub progress: Option<u8>,
}

impl BlockJobInfo {
    pub fn is_backup(&self) -> bool {
        self.kind == BlockJobKind::Backup
    }
}

/// Management interface of the hypervisor.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Host name of the hypervisor when the connection is remote.
    fn remote_host(&self) -> Option<&str>;

    async fn lookup_domain(&self, name: &str) -> Result<Domain, HypervisorError>;

    /// Full domain configuration document
    async fn domain_config(&self, domain: &Domain) -> Result<String, HypervisorError>;

    async fn create_checkpoint(
        &self,
        domain: &Domain,
        request: &CheckpointRequest,
    ) -> Result<(), HypervisorError>;

    /// Checkpoint names in the order the hypervisor reports them
    async fn list_checkpoints(&self, domain: &Domain) -> Result<Vec<String>, HypervisorError>;

    /// Look up a checkpoint; `NotFound` if it does not exist.
    async fn lookup_checkpoint(
        &self,
        domain: &Domain,
        name: &str,
    ) -> Result<Checkpoint, HypervisorError>;

    /// Parent reference recorded on a checkpoint. The referenced checkpoint
    /// itself may no longer exist.
    async fn checkpoint_parent(
        &self,
        domain: &Domain,
        name: &str,
    ) -> Result<Option<String>, HypervisorError> {
        Ok(self.lookup_checkpoint(domain, name).await?.parent)
    }

    /// Raw checkpoint description, optionally including size information
    async fn checkpoint_description(
        &self,
        domain: &Domain,
        name: &str,
        with_size: bool,
    ) -> Result<String, HypervisorError>;

    async fn delete_checkpoint(&self, domain: &Domain, name: &str) -> Result<(), HypervisorError>;

    /// Submit a pull-mode export. Returns once the hypervisor accepted the
    /// job; data movement happens inside the hypervisor.
    async fn begin_backup(
        &self,
        domain: &Domain,
        request: &ExportRequest,
    ) -> Result<(), HypervisorError>;

    async fn abort_job(&self, domain: &Domain) -> Result<(), HypervisorError>;

    async fn block_job_info(
        &self,
        domain: &Domain,
        target: &str,
    ) -> Result<Option<BlockJobInfo>, HypervisorError>;

    /// Resolve a storage pool volume to its path on the host
    async fn volume_path(&self, pool: &str, volume: &str) -> Result<String, HypervisorError>;
}

/// Guest filesystem quiescing.
#[async_trait]
pub trait Quiesce: Send + Sync {
    async fn freeze(&self, domain: &Domain) -> Result<(), HypervisorError>;

    async fn thaw(&self, domain: &Domain) -> Result<(), HypervisorError>;
}
