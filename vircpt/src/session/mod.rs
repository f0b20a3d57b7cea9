//! Backup session orchestration.
//!
//! A [`BackupSession`] owns one export request and walks it through
//! `Pending -> Active -> {Completed | Failed | Aborted}`:
//! - a backup block job already running on any disk refuses the start
//! - submission failures leave no guest filesystem frozen behind
//! - abort is a single, non-retried job-abort call
//!
//! The hypervisor moves the data itself; starting a session returns as soon
//! as the export was accepted.

use crate::checkpoint::{self, chain};
use crate::config::ExportConfig;
use crate::disk::{self, DiskFilter, DomainDisk};
use crate::export::{ExportRequest, ExportRequestBuilder, Transport};
use crate::hypervisor::{Domain, Hypervisor, HypervisorError, Quiesce};
use crate::utils::errors::{Result, VircptError};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a backup session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Active,
    Completed,
    Failed,
    Aborted,
}

impl SessionState {
    /// Terminal states cannot be left; retrying needs a new session.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Aborted
        )
    }
}

/// One in-flight export of a domain's disks
#[derive(Debug)]
pub struct BackupSession {
    domain: Domain,
    disks: Vec<DomainDisk>,
    anchor: Option<String>,
    request: ExportRequest,
    state: SessionState,
    frozen: bool,
    thaw_failed: bool,
}

impl BackupSession {
    pub fn new(
        domain: Domain,
        disks: Vec<DomainDisk>,
        anchor: Option<String>,
        request: ExportRequest,
    ) -> Self {
        Self {
            domain,
            disks,
            anchor,
            request,
            state: SessionState::Pending,
            frozen: false,
            thaw_failed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn disks(&self) -> &[DomainDisk] {
        &self.disks
    }

    pub fn anchor(&self) -> Option<&str> {
        self.anchor.as_deref()
    }

    pub fn request(&self) -> &ExportRequest {
        &self.request
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// The export is running but the guest filesystem could not be thawed
    pub fn thaw_failed(&self) -> bool {
        self.thaw_failed
    }

    /// Submit the export.
    ///
    /// With `quiesce`, the guest filesystem is frozen around submission.
    /// Whatever happens after the freeze, the filesystem is thawed exactly
    /// once before this returns. A failed thaw after an accepted submission
    /// does not fail the start: the export is running and the session is
    /// `Active`, with [`BackupSession::thaw_failed`] set.
    pub async fn start(&mut self, hv: &dyn Hypervisor, quiesce: Option<&dyn Quiesce>) -> Result<()> {
        if self.state != SessionState::Pending {
            return Err(VircptError::InvalidState(format!(
                "cannot start session in state {:?}",
                self.state
            )));
        }

        ensure_no_backup_job(hv, &self.domain, &self.disks).await?;

        let submitted = self.submit(hv, quiesce).await;
        let thawed = self.thaw(quiesce).await;

        match submitted {
            Ok(()) => {
                self.state = SessionState::Active;
                info!(
                    "Started {} export of domain [{}]",
                    if self.request.is_incremental() { "incremental" } else { "full" },
                    self.domain
                );
                if let Err(e) = thawed {
                    self.thaw_failed = true;
                    warn!(
                        "Export of domain [{}] is running but its filesystems are still frozen: {}",
                        self.domain, e
                    );
                }
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                error!("Failed to start export of domain [{}]: {}", self.domain, e);
                Err(e)
            }
        }
    }

    async fn submit(&mut self, hv: &dyn Hypervisor, quiesce: Option<&dyn Quiesce>) -> Result<()> {
        if let Some(quiesce) = quiesce {
            debug!("Freezing filesystems of domain [{}]", self.domain);
            quiesce
                .freeze(&self.domain)
                .await
                .map_err(|e| VircptError::Quiesce(e.to_string()))?;
            self.frozen = true;
        }

        debug!("Starting checkpoint export via API.");
        hv.begin_backup(&self.domain, &self.request)
            .await
            .map_err(|e| match e {
                HypervisorError::Busy(msg) => VircptError::Conflict(msg),
                HypervisorError::Connection(msg) => VircptError::Connection(msg),
                other => VircptError::Submission(other.to_string()),
            })?;
        debug!("Started export via API.");
        Ok(())
    }

    async fn thaw(&mut self, quiesce: Option<&dyn Quiesce>) -> Result<()> {
        if !self.frozen {
            return Ok(());
        }
        self.frozen = false;

        let Some(quiesce) = quiesce else {
            return Ok(());
        };
        debug!("Thawing filesystems of domain [{}]", self.domain);
        quiesce.thaw(&self.domain).await.map_err(|e| {
            error!("Failed to thaw filesystems of domain [{}]: {}", self.domain, e);
            VircptError::Quiesce(e.to_string())
        })
    }

    /// Cancel the running export with a single job-abort call.
    pub async fn abort(&mut self, hv: &dyn Hypervisor) -> Result<()> {
        if self.state != SessionState::Active {
            return Err(VircptError::InvalidState(format!(
                "cannot abort session in state {:?}",
                self.state
            )));
        }

        match abort_export(hv, &self.domain).await {
            Ok(()) => {
                self.state = SessionState::Aborted;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// Mark the export as finished once its data has been consumed.
    pub fn complete(&mut self) -> Result<()> {
        if self.state != SessionState::Active {
            return Err(VircptError::InvalidState(format!(
                "cannot complete session in state {:?}",
                self.state
            )));
        }
        self.state = SessionState::Completed;
        info!("Export of domain [{}] completed", self.domain);
        Ok(())
    }
}

/// Whether any of the disks already runs a backup block job.
pub async fn block_job_active(hv: &dyn Hypervisor, domain: &Domain, disks: &[DomainDisk]) -> Result<bool> {
    for disk in disks {
        if let Some(info) = hv.block_job_info(domain, &disk.target).await? {
            if info.is_backup() {
                debug!("Running block jobs for disk [{}]: {:?}", disk.target, info);
                return Ok(true);
            }
        }
    }
    Ok(false)
}

async fn ensure_no_backup_job(hv: &dyn Hypervisor, domain: &Domain, disks: &[DomainDisk]) -> Result<()> {
    if block_job_active(hv, domain, disks).await? {
        warn!("Domain [{}] already has an active backup job", domain);
        return Err(VircptError::Conflict(format!(
            "backup job already running for domain [{}]",
            domain
        )));
    }
    Ok(())
}

/// Abort the domain's running job. One attempt; the outcome is reported.
pub async fn abort_export(hv: &dyn Hypervisor, domain: &Domain) -> Result<()> {
    match hv.abort_job(domain).await {
        Ok(()) => {
            info!("Stopped export job of domain [{}]", domain);
            Ok(())
        }
        Err(e) => {
            warn!("Failed to stop block job: [{}]", e);
            Err(VircptError::Abort(e.to_string()))
        }
    }
}

/// Options for [`export_checkpoint`]
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Checkpoint to export
    pub name: String,
    /// Create the checkpoint first if it does not exist
    pub create: bool,
    /// Freeze guest filesystems around submission
    pub freeze: bool,
    pub filter: DiskFilter,
    pub export: ExportConfig,
}

/// Classify disks, resolve the anchor, build the request and start a
/// session for checkpoint `options.name`.
///
/// A checkpoint created here is deleted again if the session fails to
/// start.
pub async fn export_checkpoint<H>(hv: &H, domain: &Domain, options: &ExportOptions) -> Result<BackupSession>
where
    H: Hypervisor + Quiesce,
{
    let disks = disk::domain_disks(hv, domain, &options.filter).await?;
    if disks.is_empty() {
        return Err(VircptError::Submission(format!(
            "no disk of domain [{}] is eligible for export",
            domain
        )));
    }

    // Checked before any checkpoint is created: a conflict changes nothing.
    ensure_no_backup_job(hv, domain, &disks).await?;

    let mut created = false;
    if options.create && !checkpoint::exists(hv, domain, &options.name).await? {
        checkpoint::create(hv, domain, &options.name, &disks).await?;
        created = true;
    }

    let anchor = chain::resolve_anchor(hv, domain, &options.name).await?;
    let covered = match checkpoint::lookup(hv, domain, &options.name).await {
        Ok(cpt) => Some(cpt.disks),
        Err(VircptError::CheckpointNotFound(_)) => None,
        Err(e) => return Err(e),
    };

    let transport = Transport::for_connection(hv.remote_host(), &options.export);
    let mut builder = ExportRequestBuilder::new(transport, &options.export.scratch_dir)
        .checkpoint(&options.name, anchor.as_deref());
    if let Some(covered) = &covered {
        builder = builder.covered_disks(covered);
    }
    let request = builder.build(&disks, &mut rand::thread_rng());

    let mut session = BackupSession::new(domain.clone(), disks, anchor, request);
    let quiesce = if options.freeze { Some(hv as &dyn Quiesce) } else { None };

    if let Err(e) = session.start(hv, quiesce).await {
        if created && session.state() != SessionState::Active {
            warn!("Removing checkpoint [{}] created for failed export", options.name);
            if !checkpoint::delete(hv, domain, &options.name).await.is_success() {
                error!("Checkpoint [{}] left behind after failed export", options.name);
            }
        }
        return Err(e);
    }

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{AttachmentKind, DeviceKind};
    use crate::hypervisor::{BlockJobKind, MockHypervisor};
    use std::path::{Path, PathBuf};

    fn disk(target: &str) -> DomainDisk {
        DomainDisk {
            target: target.to_string(),
            format: "qcow2".to_string(),
            source_path: PathBuf::from(format!("/images/{}", target)),
            device: DeviceKind::Disk,
            attachment: AttachmentKind::File,
        }
    }

    fn session(disks: Vec<DomainDisk>) -> BackupSession {
        let transport = Transport::Unix {
            socket: PathBuf::from("/var/tmp/vircpt.sock"),
        };
        let request = ExportRequestBuilder::new(transport, Path::new("/var/tmp"))
            .build(&disks, &mut rand::thread_rng());
        BackupSession::new(Domain::new("vm1"), disks, None, request)
    }

    #[tokio::test]
    async fn test_start_submits_once() {
        let hv = MockHypervisor::new();
        let mut s = session(vec![disk("sda"), disk("sdb")]);

        s.start(&hv, None).await.unwrap();
        assert_eq!(s.state(), SessionState::Active);
        assert_eq!(hv.submitted().len(), 1);
        assert_eq!(hv.block_job_queries(), vec!["sda", "sdb"]);
    }

    #[tokio::test]
    async fn test_conflict_submits_nothing() {
        let hv = MockHypervisor::new().with_block_job("sdb", BlockJobKind::Backup);
        let mut s = session(vec![disk("sda"), disk("sdb")]);

        let err = s.start(&hv, Some(&hv)).await.unwrap_err();
        assert!(matches!(err, VircptError::Conflict(_)));
        assert_eq!(s.state(), SessionState::Pending);
        assert!(hv.submitted().is_empty());
        assert_eq!(hv.freeze_calls(), 0);
    }

    #[tokio::test]
    async fn test_other_block_jobs_do_not_conflict() {
        let hv = MockHypervisor::new().with_block_job("sda", BlockJobKind::Commit);
        let mut s = session(vec![disk("sda")]);

        s.start(&hv, None).await.unwrap();
        assert_eq!(s.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_submission_failure_thaws_once() {
        let hv = MockHypervisor::new();
        hv.fail_backup(HypervisorError::Command {
            command: "backup-begin".to_string(),
            message: "internal error".to_string(),
        });
        let mut s = session(vec![disk("sda")]);

        let err = s.start(&hv, Some(&hv)).await.unwrap_err();
        assert!(matches!(err, VircptError::Submission(_)));
        assert_eq!(s.state(), SessionState::Failed);
        assert_eq!(hv.freeze_calls(), 1);
        assert_eq!(hv.thaw_calls(), 1);
        assert!(!s.is_frozen());
    }

    #[tokio::test]
    async fn test_submission_race_reports_conflict() {
        let hv = MockHypervisor::new();
        hv.fail_backup(HypervisorError::Busy("disk 'sda' has an active block job".to_string()));
        let mut s = session(vec![disk("sda")]);

        let err = s.start(&hv, Some(&hv)).await.unwrap_err();
        assert!(matches!(err, VircptError::Conflict(_)));
        assert_eq!(s.state(), SessionState::Failed);
        assert_eq!(hv.thaw_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_freeze_needs_no_thaw() {
        let hv = MockHypervisor::new();
        hv.fail_freeze(HypervisorError::Command {
            command: "domfsfreeze".to_string(),
            message: "guest agent is not responding".to_string(),
        });
        let mut s = session(vec![disk("sda")]);

        let err = s.start(&hv, Some(&hv)).await.unwrap_err();
        assert!(matches!(err, VircptError::Quiesce(_)));
        assert_eq!(s.state(), SessionState::Failed);
        assert_eq!(hv.thaw_calls(), 0);
        assert!(hv.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_successful_start_thaws() {
        let hv = MockHypervisor::new();
        let mut s = session(vec![disk("sda")]);

        s.start(&hv, Some(&hv)).await.unwrap();
        assert_eq!(hv.freeze_calls(), 1);
        assert_eq!(hv.thaw_calls(), 1);
        assert!(!s.thaw_failed());
    }

    #[tokio::test]
    async fn test_thaw_failure_keeps_running_export() {
        let hv = MockHypervisor::new();
        hv.fail_thaw(HypervisorError::Command {
            command: "domfsthaw".to_string(),
            message: "guest agent is not responding".to_string(),
        });
        let mut s = session(vec![disk("sda")]);

        s.start(&hv, Some(&hv)).await.unwrap();
        assert_eq!(s.state(), SessionState::Active);
        assert!(s.thaw_failed());
        assert!(!s.is_frozen());
        assert_eq!(hv.submitted().len(), 1);
        assert_eq!(hv.thaw_calls(), 1);

        // the session can still be aborted
        s.abort(&hv).await.unwrap();
        assert_eq!(s.state(), SessionState::Aborted);
    }

    #[tokio::test]
    async fn test_thaw_failure_after_rejected_submission_keeps_original_error() {
        let hv = MockHypervisor::new();
        hv.fail_backup(HypervisorError::Command {
            command: "backup-begin".to_string(),
            message: "internal error".to_string(),
        });
        hv.fail_thaw(HypervisorError::Command {
            command: "domfsthaw".to_string(),
            message: "guest agent is not responding".to_string(),
        });
        let mut s = session(vec![disk("sda")]);

        let err = s.start(&hv, Some(&hv)).await.unwrap_err();
        assert!(matches!(err, VircptError::Submission(_)));
        assert_eq!(s.state(), SessionState::Failed);
        assert_eq!(hv.thaw_calls(), 1);
    }

    #[tokio::test]
    async fn test_terminal_states_not_reentered() {
        let hv = MockHypervisor::new();
        let mut s = session(vec![disk("sda")]);
        s.start(&hv, None).await.unwrap();
        s.complete().unwrap();

        assert!(s.state().is_terminal());
        assert!(matches!(s.start(&hv, None).await, Err(VircptError::InvalidState(_))));
        assert!(matches!(s.abort(&hv).await, Err(VircptError::InvalidState(_))));
        assert!(matches!(s.complete(), Err(VircptError::InvalidState(_))));
        assert_eq!(hv.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_abort() {
        let hv = MockHypervisor::new();
        let mut s = session(vec![disk("sda")]);

        assert!(matches!(s.abort(&hv).await, Err(VircptError::InvalidState(_))));
        assert_eq!(hv.abort_calls(), 0);

        s.start(&hv, None).await.unwrap();
        s.abort(&hv).await.unwrap();
        assert_eq!(s.state(), SessionState::Aborted);
        assert_eq!(hv.abort_calls(), 1);
    }

    #[tokio::test]
    async fn test_abort_failure_is_reported_not_retried() {
        let hv = MockHypervisor::new();
        let mut s = session(vec![disk("sda")]);
        s.start(&hv, None).await.unwrap();
        hv.fail_abort(HypervisorError::Command {
            command: "domjobabort".to_string(),
            message: "no job is active on the domain".to_string(),
        });

        let err = s.abort(&hv).await.unwrap_err();
        assert!(matches!(err, VircptError::Abort(_)));
        assert_eq!(s.state(), SessionState::Failed);
        assert_eq!(hv.abort_calls(), 1);
    }
}
