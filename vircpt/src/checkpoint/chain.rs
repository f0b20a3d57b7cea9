//! Incremental anchor resolution.
//!
//! A backup of checkpoint `C` is incremental relative to `C`'s parent `P`,
//! provided `P` still exists. Anything else is a full export.

use crate::hypervisor::{Domain, Hypervisor, HypervisorError};
use crate::utils::errors::Result;
use tracing::{debug, info, warn};

/// Resolve the checkpoint a backup of `candidate` is anchored to.
///
/// Returns `None` for a full export: the candidate does not exist yet, has
/// no parent, or its recorded parent can no longer be found. Connection
/// failures are propagated.
pub async fn resolve_anchor(
    hv: &dyn Hypervisor,
    domain: &Domain,
    candidate: &str,
) -> Result<Option<String>> {
    let parent = match hv.checkpoint_parent(domain, candidate).await {
        Ok(Some(parent)) => parent,
        Ok(None) => {
            debug!("Checkpoint [{}] has no parent, full export", candidate);
            return Ok(None);
        }
        Err(HypervisorError::NotFound(_)) => {
            debug!("Checkpoint [{}] does not exist yet, full export", candidate);
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    // TODO: surface a dangling parent to the operator instead of silently
    // downgrading; it may be a typo'd checkpoint name.
    match hv.lookup_checkpoint(domain, &parent).await {
        Ok(_) => {
            info!("Export checkpoint based on parent checkpoint: [{}]", parent);
            Ok(Some(parent))
        }
        Err(HypervisorError::NotFound(_)) => {
            warn!(
                "Parent checkpoint [{}] of [{}] not found, falling back to full export",
                parent, candidate
            );
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::hypervisor::MockHypervisor;
    use crate::utils::errors::VircptError;

    fn checkpoint(name: &str, parent: Option<&str>) -> Checkpoint {
        Checkpoint {
            name: name.to_string(),
            parent: parent.map(str::to_string),
            creation_time: None,
            disks: vec!["sda".to_string()],
        }
    }

    #[tokio::test]
    async fn test_unknown_candidate_is_full_export() {
        let hv = MockHypervisor::new();
        let domain = Domain::new("vm1");
        assert_eq!(resolve_anchor(&hv, &domain, "cpt1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_root_checkpoint_is_full_export() {
        let hv = MockHypervisor::new().with_checkpoint("vm1", checkpoint("cpt1", None));
        let domain = Domain::new("vm1");
        assert_eq!(resolve_anchor(&hv, &domain, "cpt1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_existing_parent_is_anchor() {
        let hv = MockHypervisor::new()
            .with_checkpoint("vm1", checkpoint("cpt1", None))
            .with_checkpoint("vm1", checkpoint("cpt2", Some("cpt1")));
        let domain = Domain::new("vm1");
        assert_eq!(
            resolve_anchor(&hv, &domain, "cpt2").await.unwrap().as_deref(),
            Some("cpt1")
        );
    }

    #[tokio::test]
    async fn test_dangling_parent_degrades_to_full_export() {
        let hv = MockHypervisor::new().with_checkpoint("vm1", checkpoint("cpt2", Some("gone")));
        let domain = Domain::new("vm1");
        assert_eq!(resolve_anchor(&hv, &domain, "cpt2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_candidate_lookup_failure_propagates() {
        let hv = MockHypervisor::new().with_checkpoint("vm1", checkpoint("cpt1", None));
        hv.fail_lookup("cpt1", HypervisorError::Connection("end of file while reading data".to_string()));
        let domain = Domain::new("vm1");

        let err = resolve_anchor(&hv, &domain, "cpt1").await.unwrap_err();
        assert!(matches!(err, VircptError::Connection(_)));
    }

    #[tokio::test]
    async fn test_parent_lookup_failure_propagates() {
        let hv = MockHypervisor::new()
            .with_checkpoint("vm1", checkpoint("cpt1", None))
            .with_checkpoint("vm1", checkpoint("cpt2", Some("cpt1")));
        hv.fail_lookup("cpt1", HypervisorError::Connection("end of file while reading data".to_string()));
        let domain = Domain::new("vm1");

        let err = resolve_anchor(&hv, &domain, "cpt2").await.unwrap_err();
        assert!(matches!(err, VircptError::Connection(_)));
    }
}
