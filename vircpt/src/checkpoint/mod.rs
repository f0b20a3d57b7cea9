//! Checkpoint records: create, look up, list and delete.

pub mod chain;

use crate::disk::DomainDisk;
use crate::hypervisor::{Domain, Hypervisor, HypervisorError};
use crate::utils::errors::{Result, VircptError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

pub use chain::resolve_anchor;

/// Description attached to every checkpoint this tool creates
pub const CHECKPOINT_DESCRIPTION: &str = "vircpt checkpoint";

/// Checkpoint as reported by the hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub name: String,
    pub parent: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    /// Disk targets covered by the checkpoint's bitmaps
    pub disks: Vec<String>,
}

/// Checkpoint creation description handed to the hypervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRequest {
    pub name: String,
    pub description: String,
    pub disks: Vec<String>,
}

impl CheckpointRequest {
    /// Build a creation request; raw-format disks are left out because they
    /// cannot hold a bitmap.
    pub fn new(name: &str, disks: &[DomainDisk]) -> Self {
        let disks = disks
            .iter()
            .filter(|d| {
                if !d.tracks_checkpoints() {
                    debug!("Disk [{}] has raw format, not part of checkpoint", d.target);
                }
                d.tracks_checkpoints()
            })
            .map(|d| d.target.clone())
            .collect();

        Self {
            name: name.to_string(),
            description: CHECKPOINT_DESCRIPTION.to_string(),
            disks,
        }
    }
}

/// Outcome of deleting a single checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Removed,
    /// The checkpoint did not exist (anymore)
    AlreadyGone,
    Failed(String),
}

impl DeleteOutcome {
    /// Removed and already-gone both count as success for cleanup purposes
    pub fn is_success(&self) -> bool {
        !matches!(self, DeleteOutcome::Failed(_))
    }
}

/// Create checkpoint `name` covering the given disks.
pub async fn create(
    hv: &dyn Hypervisor,
    domain: &Domain,
    name: &str,
    disks: &[DomainDisk],
) -> Result<()> {
    let request = CheckpointRequest::new(name, disks);
    if request.disks.is_empty() {
        return Err(VircptError::CheckpointCreate(format!(
            "no disk of domain [{}] supports checkpoints",
            domain
        )));
    }

    hv.create_checkpoint(domain, &request)
        .await
        .map_err(|e| match e {
            HypervisorError::Connection(msg) => VircptError::Connection(msg),
            other => VircptError::CheckpointCreate(other.to_string()),
        })?;

    info!(
        "Created checkpoint [{}] for disks: {}",
        name,
        request.disks.join(",")
    );
    Ok(())
}

/// Look up a checkpoint by name.
pub async fn lookup(hv: &dyn Hypervisor, domain: &Domain, name: &str) -> Result<Checkpoint> {
    hv.lookup_checkpoint(domain, name).await.map_err(|e| match e {
        HypervisorError::NotFound(_) => VircptError::CheckpointNotFound(name.to_string()),
        other => other.into(),
    })
}

/// Whether a checkpoint with this name exists.
pub async fn exists(hv: &dyn Hypervisor, domain: &Domain, name: &str) -> Result<bool> {
    match lookup(hv, domain, name).await {
        Ok(_) => Ok(true),
        Err(VircptError::CheckpointNotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// All checkpoints of a domain, in the order the hypervisor reports them.
pub async fn list(hv: &dyn Hypervisor, domain: &Domain) -> Result<Vec<String>> {
    Ok(hv.list_checkpoints(domain).await?)
}

/// Look up every listed checkpoint.
///
/// A checkpoint removed between listing and lookup is skipped.
pub async fn list_details(hv: &dyn Hypervisor, domain: &Domain) -> Result<Vec<Checkpoint>> {
    let names = list(hv, domain).await?;
    let mut checkpoints = Vec::with_capacity(names.len());
    for name in &names {
        match lookup(hv, domain, name).await {
            Ok(cpt) => checkpoints.push(cpt),
            Err(VircptError::CheckpointNotFound(_)) => {
                debug!("Checkpoint [{}] disappeared while listing", name)
            }
            Err(e) => return Err(e),
        }
    }
    Ok(checkpoints)
}

/// Checkpoint description document, with size information when the
/// hypervisor supports it.
pub async fn describe(hv: &dyn Hypervisor, domain: &Domain, name: &str) -> Result<String> {
    match hv.checkpoint_description(domain, name, true).await {
        Ok(doc) => Ok(doc),
        Err(HypervisorError::NotFound(_)) => Err(VircptError::CheckpointNotFound(name.to_string())),
        Err(HypervisorError::Connection(msg)) => Err(VircptError::Connection(msg)),
        Err(e) => {
            warn!("Failed to get checkpoint info with size information: [{}]", e);
            hv.checkpoint_description(domain, name, false)
                .await
                .map_err(|e| match e {
                    HypervisorError::NotFound(_) => VircptError::CheckpointNotFound(name.to_string()),
                    other => other.into(),
                })
        }
    }
}

/// Delete one checkpoint. Never fails; the outcome says what happened.
pub async fn delete(hv: &dyn Hypervisor, domain: &Domain, name: &str) -> DeleteOutcome {
    debug!("Attempt to remove checkpoint: [{}]", name);
    match hv.delete_checkpoint(domain, name).await {
        Ok(()) => {
            debug!("Removed checkpoint: [{}]", name);
            DeleteOutcome::Removed
        }
        Err(HypervisorError::NotFound(_)) => {
            info!("Checkpoint [{}] already removed", name);
            DeleteOutcome::AlreadyGone
        }
        Err(e) => {
            error!("Error during checkpoint removal: [{}]", e);
            DeleteOutcome::Failed(e.to_string())
        }
    }
}

/// Delete every checkpoint of a domain, continuing past failures.
pub async fn delete_all(hv: &dyn Hypervisor, domain: &Domain) -> Result<Vec<(String, DeleteOutcome)>> {
    let names = list(hv, domain).await?;
    let mut outcomes = Vec::with_capacity(names.len());

    for name in names {
        let outcome = delete(hv, domain, &name).await;
        outcomes.push((name, outcome));
    }

    Ok(outcomes)
}
