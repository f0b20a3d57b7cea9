//! In-memory hypervisor for tests and dry runs.
//!
//! Domains, checkpoints, volumes and block jobs live in a mutex-guarded
//! state. Every submission, abort and quiesce call is recorded so callers can
//! assert on what was sent. Failures can be injected per operation.

use super::{BlockJobInfo, BlockJobKind, Domain, Hypervisor, HypervisorError, Quiesce};
use crate::checkpoint::{Checkpoint, CheckpointRequest};
use crate::export::ExportRequest;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MockState {
    domains: HashMap<String, String>,
    /// Per-domain checkpoints in creation order
    checkpoints: HashMap<String, Vec<Checkpoint>>,
    /// Most recently created checkpoint per domain
    current: HashMap<String, String>,
    volumes: HashMap<(String, String), String>,
    block_jobs: HashMap<String, BlockJobInfo>,
    size_supported: bool,

    fail_backup: Option<HypervisorError>,
    fail_abort: Option<HypervisorError>,
    fail_freeze: Option<HypervisorError>,
    fail_thaw: Option<HypervisorError>,
    fail_delete: HashSet<String>,
    fail_lookup: HashMap<String, HypervisorError>,

    submitted: Vec<ExportRequest>,
    block_job_queries: Vec<String>,
    abort_calls: usize,
    freeze_calls: usize,
    thaw_calls: usize,
}

/// In-memory [`Hypervisor`] and [`Quiesce`] implementation
#[derive(Debug)]
pub struct MockHypervisor {
    state: Mutex<MockState>,
    remote_host: Option<String>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                size_supported: true,
                ..MockState::default()
            }),
            remote_host: None,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a domain with its configuration document
    pub fn with_domain(self, name: &str, config: &str) -> Self {
        self.state().domains.insert(name.to_string(), config.to_string());
        self
    }

    /// Insert a checkpoint record as-is, without touching parent links
    pub fn with_checkpoint(self, domain: &str, checkpoint: Checkpoint) -> Self {
        {
            let mut state = self.state();
            state.current.insert(domain.to_string(), checkpoint.name.clone());
            state
                .checkpoints
                .entry(domain.to_string())
                .or_default()
                .push(checkpoint);
        }
        self
    }

    pub fn with_volume(self, pool: &str, volume: &str, path: &str) -> Self {
        self.state()
            .volumes
            .insert((pool.to_string(), volume.to_string()), path.to_string());
        self
    }

    pub fn with_block_job(self, target: &str, kind: BlockJobKind) -> Self {
        self.state().block_jobs.insert(
            target.to_string(),
            BlockJobInfo {
                kind,
                progress: Some(0),
            },
        );
        self
    }

    pub fn with_remote_host(mut self, host: &str) -> Self {
        self.remote_host = Some(host.to_string());
        self
    }

    /// Make checkpoint descriptions reject the size flag
    pub fn without_size_support(self) -> Self {
        self.state().size_supported = false;
        self
    }

    pub fn fail_backup(&self, err: HypervisorError) {
        self.state().fail_backup = Some(err);
    }

    pub fn fail_abort(&self, err: HypervisorError) {
        self.state().fail_abort = Some(err);
    }

    pub fn fail_freeze(&self, err: HypervisorError) {
        self.state().fail_freeze = Some(err);
    }

    pub fn fail_thaw(&self, err: HypervisorError) {
        self.state().fail_thaw = Some(err);
    }

    pub fn fail_delete(&self, name: &str) {
        self.state().fail_delete.insert(name.to_string());
    }

    /// Make every lookup of checkpoint `name` fail with `err`
    pub fn fail_lookup(&self, name: &str, err: HypervisorError) {
        self.state().fail_lookup.insert(name.to_string(), err);
    }

    /// Let running backup jobs finish, as the hypervisor would once the
    /// exported data has been read
    pub fn finish_jobs(&self) {
        self.state().block_jobs.retain(|_, job| !job.is_backup());
    }

    /// Export requests accepted or attempted, in call order
    pub fn submitted(&self) -> Vec<ExportRequest> {
        self.state().submitted.clone()
    }

    pub fn block_job_queries(&self) -> Vec<String> {
        self.state().block_job_queries.clone()
    }

    pub fn abort_calls(&self) -> usize {
        self.state().abort_calls
    }

    pub fn freeze_calls(&self) -> usize {
        self.state().freeze_calls
    }

    pub fn thaw_calls(&self) -> usize {
        self.state().thaw_calls
    }

    pub fn checkpoint_names(&self, domain: &str) -> Vec<String> {
        self.state()
            .checkpoints
            .get(domain)
            .map(|list| list.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    fn find_checkpoint(state: &MockState, domain: &Domain, name: &str) -> Option<Checkpoint> {
        state
            .checkpoints
            .get(domain.name())
            .and_then(|list| list.iter().find(|c| c.name == name))
            .cloned()
    }
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn checkpoint_not_found(name: &str) -> HypervisorError {
    HypervisorError::NotFound(format!("no domain checkpoint with matching name '{}'", name))
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    fn remote_host(&self) -> Option<&str> {
        self.remote_host.as_deref()
    }

    async fn lookup_domain(&self, name: &str) -> Result<Domain, HypervisorError> {
        if self.state().domains.contains_key(name) {
            Ok(Domain::new(name))
        } else {
            Err(HypervisorError::NotFound(format!(
                "no domain with matching name '{}'",
                name
            )))
        }
    }

    async fn domain_config(&self, domain: &Domain) -> Result<String, HypervisorError> {
        self.state()
            .domains
            .get(domain.name())
            .cloned()
            .ok_or_else(|| HypervisorError::NotFound(domain.name().to_string()))
    }

    async fn create_checkpoint(
        &self,
        domain: &Domain,
        request: &CheckpointRequest,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state();
        if Self::find_checkpoint(&state, domain, &request.name).is_some() {
            return Err(HypervisorError::Command {
                command: "checkpoint-create".to_string(),
                message: format!("domain checkpoint '{}' already exists", request.name),
            });
        }

        let parent = state.current.get(domain.name()).cloned();
        let checkpoint = Checkpoint {
            name: request.name.clone(),
            parent,
            creation_time: Some(chrono::Utc::now()),
            disks: request.disks.clone(),
        };
        state
            .current
            .insert(domain.name().to_string(), request.name.clone());
        state
            .checkpoints
            .entry(domain.name().to_string())
            .or_default()
            .push(checkpoint);
        Ok(())
    }

    async fn list_checkpoints(&self, domain: &Domain) -> Result<Vec<String>, HypervisorError> {
        Ok(self.checkpoint_names(domain.name()))
    }

    async fn lookup_checkpoint(
        &self,
        domain: &Domain,
        name: &str,
    ) -> Result<Checkpoint, HypervisorError> {
        let state = self.state();
        if let Some(err) = state.fail_lookup.get(name) {
            return Err(err.clone());
        }
        Self::find_checkpoint(&state, domain, name).ok_or_else(|| checkpoint_not_found(name))
    }

    async fn checkpoint_description(
        &self,
        domain: &Domain,
        name: &str,
        with_size: bool,
    ) -> Result<String, HypervisorError> {
        let state = self.state();
        if with_size && !state.size_supported {
            return Err(HypervisorError::Unsupported(
                "unsupported flag (0x1)".to_string(),
            ));
        }
        let checkpoint =
            Self::find_checkpoint(&state, domain, name).ok_or_else(|| checkpoint_not_found(name))?;

        let mut out = format!("<domaincheckpoint>\n  <name>{}</name>\n", checkpoint.name);
        if let Some(parent) = &checkpoint.parent {
            out.push_str(&format!("  <parent>\n    <name>{}</name>\n  </parent>\n", parent));
        }
        out.push_str("  <disks>\n");
        for disk in &checkpoint.disks {
            if with_size {
                out.push_str(&format!(
                    "    <disk name='{}' checkpoint='bitmap' bitmap='{}' size='0'/>\n",
                    disk, checkpoint.name
                ));
            } else {
                out.push_str(&format!(
                    "    <disk name='{}' checkpoint='bitmap' bitmap='{}'/>\n",
                    disk, checkpoint.name
                ));
            }
        }
        out.push_str("  </disks>\n</domaincheckpoint>\n");
        Ok(out)
    }

    async fn delete_checkpoint(&self, domain: &Domain, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.state();
        if state.fail_delete.contains(name) {
            return Err(HypervisorError::Command {
                command: "checkpoint-delete".to_string(),
                message: format!("cannot delete checkpoint '{}'", name),
            });
        }

        let list = state.checkpoints.entry(domain.name().to_string()).or_default();
        let index = list
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| checkpoint_not_found(name))?;
        let removed = list.remove(index);

        // Children are re-parented onto the removed checkpoint's parent
        for child in list.iter_mut() {
            if child.parent.as_deref() == Some(name) {
                child.parent = removed.parent.clone();
            }
        }
        let last = list.last().map(|c| c.name.clone());
        match last {
            Some(last) => state.current.insert(domain.name().to_string(), last),
            None => state.current.remove(domain.name()),
        };
        Ok(())
    }

    async fn begin_backup(
        &self,
        _domain: &Domain,
        request: &ExportRequest,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state();
        state.submitted.push(request.clone());
        if let Some(err) = state.fail_backup.clone() {
            return Err(err);
        }
        for disk in &request.disks {
            state.block_jobs.insert(
                disk.target.clone(),
                BlockJobInfo {
                    kind: BlockJobKind::Backup,
                    progress: Some(0),
                },
            );
        }
        Ok(())
    }

    async fn abort_job(&self, _domain: &Domain) -> Result<(), HypervisorError> {
        let mut state = self.state();
        state.abort_calls += 1;
        if let Some(err) = state.fail_abort.clone() {
            return Err(err);
        }
        state.block_jobs.retain(|_, job| !job.is_backup());
        Ok(())
    }

    async fn block_job_info(
        &self,
        _domain: &Domain,
        target: &str,
    ) -> Result<Option<BlockJobInfo>, HypervisorError> {
        let mut state = self.state();
        state.block_job_queries.push(target.to_string());
        Ok(state.block_jobs.get(target).cloned())
    }

    async fn volume_path(&self, pool: &str, volume: &str) -> Result<String, HypervisorError> {
        self.state()
            .volumes
            .get(&(pool.to_string(), volume.to_string()))
            .cloned()
            .ok_or_else(|| {
                HypervisorError::NotFound(format!(
                    "Storage volume not found: no storage vol with matching path '{}' in pool '{}'",
                    volume, pool
                ))
            })
    }
}

#[async_trait]
impl Quiesce for MockHypervisor {
    async fn freeze(&self, _domain: &Domain) -> Result<(), HypervisorError> {
        let mut state = self.state();
        state.freeze_calls += 1;
        match state.fail_freeze.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn thaw(&self, _domain: &Domain) -> Result<(), HypervisorError> {
        let mut state = self.state();
        state.thaw_calls += 1;
        match state.fail_thaw.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
