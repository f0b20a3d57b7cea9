//! vircpt library
//!
//! Checkpoint and incremental backup orchestration for libvirt domains:
//! disk eligibility, checkpoint chains, export requests and the lifecycle of
//! an in-flight pull-mode backup.

pub mod checkpoint;
pub mod config;
pub mod disk;
pub mod export;
pub mod hypervisor;
pub mod session;
pub mod utils;
pub mod xml;

// Re-export commonly used types
pub use config::Config;
pub use hypervisor::{Domain, Hypervisor, Quiesce};
pub use session::{BackupSession, SessionState};
pub use utils::errors::VircptError;
pub type Result<T> = std::result::Result<T, VircptError>;
