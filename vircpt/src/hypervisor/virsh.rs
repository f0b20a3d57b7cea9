//! libvirt binding driven through the `virsh` command-line client.
//!
//! Every call runs `virsh -c <uri> <command> ...` and maps a non-zero exit
//! status to a [`HypervisorError`] based on the message libvirt prints.

use super::{BlockJobInfo, BlockJobKind, Domain, Hypervisor, HypervisorError, Quiesce};
use crate::checkpoint::{Checkpoint, CheckpointRequest};
use crate::export::ExportRequest;
use crate::xml;
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Hypervisor reached through the `virsh` client
#[derive(Debug, Clone)]
pub struct VirshHypervisor {
    uri: String,
    virsh: PathBuf,
    remote_host: Option<String>,
}

impl VirshHypervisor {
    /// Open a connection and verify that the daemon answers.
    pub async fn connect(uri: &str, virsh: &Path) -> Result<Self, HypervisorError> {
        debug!("Libvirt URI: [{}]", uri);
        let local = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        debug!("Hostname: [{}]", local);

        let hypervisor = Self {
            uri: uri.to_string(),
            virsh: virsh.to_path_buf(),
            remote_host: remote_host_of(uri, &local),
        };

        let version = hypervisor.run(&["version"]).await.map_err(|e| match e {
            HypervisorError::Connection(msg) => HypervisorError::Connection(msg),
            other => HypervisorError::Connection(other.to_string()),
        })?;
        if let Some(line) = version.lines().find(|l| l.contains("libvirt")) {
            debug!("{}", line.trim());
        }
        if let Some(host) = &hypervisor.remote_host {
            info!("Connected to remote hypervisor [{}]", host);
        }

        Ok(hypervisor)
    }

    async fn run(&self, args: &[&str]) -> Result<String, HypervisorError> {
        debug!("CMD: virsh -c {} {}", self.uri, args.join(" "));
        let output = Command::new(&self.virsh)
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("Return code: {:?}", output.status.code());
            return Err(classify_failure(args.first().copied().unwrap_or("virsh"), &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a command that takes a description document as a file argument.
    async fn run_with_document(
        &self,
        command: &str,
        domain: &Domain,
        document: &str,
    ) -> Result<String, HypervisorError> {
        debug!("{} document:\n{}", command, document);
        let mut file = tempfile::Builder::new()
            .prefix("vircpt.")
            .suffix(".xml")
            .tempfile()?;
        file.write_all(document.as_bytes())?;
        file.flush()?;

        let path = file.path().to_string_lossy().into_owned();
        self.run(&[command, domain.name(), &path]).await
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    fn remote_host(&self) -> Option<&str> {
        self.remote_host.as_deref()
    }

    async fn lookup_domain(&self, name: &str) -> Result<Domain, HypervisorError> {
        self.run(&["domuuid", name]).await?;
        Ok(Domain::new(name))
    }

    async fn domain_config(&self, domain: &Domain) -> Result<String, HypervisorError> {
        self.run(&["dumpxml", domain.name()]).await
    }

    async fn create_checkpoint(
        &self,
        domain: &Domain,
        request: &CheckpointRequest,
    ) -> Result<(), HypervisorError> {
        let document = xml::checkpoint_document(request)?;
        self.run_with_document("checkpoint-create", domain, &document)
            .await
            .map(|_| ())
    }

    async fn list_checkpoints(&self, domain: &Domain) -> Result<Vec<String>, HypervisorError> {
        let out = self.run(&["checkpoint-list", domain.name(), "--name"]).await?;
        Ok(parse_name_list(&out))
    }

    async fn lookup_checkpoint(
        &self,
        domain: &Domain,
        name: &str,
    ) -> Result<Checkpoint, HypervisorError> {
        let document = self.run(&["checkpoint-dumpxml", domain.name(), name]).await?;
        xml::parse_checkpoint(&document)
    }

    async fn checkpoint_description(
        &self,
        domain: &Domain,
        name: &str,
        with_size: bool,
    ) -> Result<String, HypervisorError> {
        if with_size {
            self.run(&["checkpoint-dumpxml", domain.name(), name, "--size"]).await
        } else {
            self.run(&["checkpoint-dumpxml", domain.name(), name]).await
        }
    }

    async fn delete_checkpoint(&self, domain: &Domain, name: &str) -> Result<(), HypervisorError> {
        self.run(&["checkpoint-delete", domain.name(), name])
            .await
            .map(|_| ())
    }

    async fn begin_backup(
        &self,
        domain: &Domain,
        request: &ExportRequest,
    ) -> Result<(), HypervisorError> {
        let document = xml::backup_document(request)?;
        self.run_with_document("backup-begin", domain, &document)
            .await
            .map(|_| ())
    }

    async fn abort_job(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.run(&["domjobabort", domain.name()]).await.map(|_| ())
    }

    async fn block_job_info(
        &self,
        domain: &Domain,
        target: &str,
    ) -> Result<Option<BlockJobInfo>, HypervisorError> {
        let out = self.run(&["blockjob", domain.name(), target, "--info"]).await?;
        Ok(parse_block_job(&out))
    }

    async fn volume_path(&self, pool: &str, volume: &str) -> Result<String, HypervisorError> {
        let out = self.run(&["vol-path", "--pool", pool, volume]).await?;
        Ok(out.trim().to_string())
    }
}

#[async_trait]
impl Quiesce for VirshHypervisor {
    async fn freeze(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.run(&["domfsfreeze", domain.name()]).await.map(|_| ())
    }

    async fn thaw(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.run(&["domfsthaw", domain.name()]).await.map(|_| ())
    }
}

/// Host component of a libvirt URI, unless it names the local machine.
///
/// `qemu:///system` is local, `qemu+ssh://root@kvm01/system` is remote
/// (`kvm01`).
pub fn remote_host_of(uri: &str, local_hostname: &str) -> Option<String> {
    let (_, rest) = uri.split_once("://")?;
    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let host = match host.strip_prefix('[') {
        Some(v6) => v6.split(']').next().unwrap_or_default(),
        None => host.split(':').next().unwrap_or_default(),
    };

    if host.is_empty()
        || host.eq_ignore_ascii_case("localhost")
        || host == "127.0.0.1"
        || host == "::1"
        || host.eq_ignore_ascii_case(local_hostname)
    {
        return None;
    }

    Some(host.to_string())
}

/// Map a failed virsh invocation to an error kind
fn classify_failure(command: &str, stderr: &str) -> HypervisorError {
    let message = stderr
        .lines()
        .map(|l| l.trim().trim_start_matches("error:").trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(": ");
    let lower = message.to_lowercase();

    if lower.contains("failed to connect") || lower.contains("unable to connect") {
        HypervisorError::Connection(message)
    } else if lower.contains("not found") || lower.contains("no domain with matching") {
        HypervisorError::NotFound(message)
    } else if lower.contains("block job") || lower.contains("already in progress") || lower.contains("in use") {
        HypervisorError::Busy(message)
    } else if lower.contains("unsupported") || lower.contains("not supported") {
        HypervisorError::Unsupported(message)
    } else {
        HypervisorError::Command {
            command: command.to_string(),
            message,
        }
    }
}

fn parse_name_list(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `virsh blockjob --info` output, e.g. `Backup: [ 42 %]`.
fn parse_block_job(out: &str) -> Option<BlockJobInfo> {
    let line = out.lines().map(str::trim).find(|l| !l.is_empty())?;
    if line.starts_with("No current block job") {
        return None;
    }

    let (label, rest) = line.split_once(':')?;
    let kind = match label.trim() {
        "Block Pull" => BlockJobKind::Pull,
        "Block Copy" => BlockJobKind::Copy,
        "Block Commit" => BlockJobKind::Commit,
        "Active Block Commit" => BlockJobKind::ActiveCommit,
        "Backup" => BlockJobKind::Backup,
        other => BlockJobKind::Unknown(other.to_string()),
    };
    let progress = rest
        .trim()
        .trim_start_matches('[')
        .split('%')
        .next()
        .and_then(|p| p.trim().parse::<f32>().ok())
        .map(|p| p.clamp(0.0, 100.0) as u8);

    Some(BlockJobInfo { kind, progress })
}
