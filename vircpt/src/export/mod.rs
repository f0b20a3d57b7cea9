//! Export request construction.
//!
//! An [`ExportRequest`] describes a pull-mode backup: where the hypervisor
//! serves the data, which checkpoint the export is incremental to, and one
//! scratch file per disk. Building it performs no I/O.

use crate::config::ExportConfig;
use crate::disk::DomainDisk;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Length of the random part of scratch file names.
///
/// Only collision avoidance between concurrent sessions matters here, so a
/// plain thread-local generator is enough.
pub const SCRATCH_ID_LEN: usize = 8;

/// Where the hypervisor exposes the exported disks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Local NBD socket
    Unix { socket: PathBuf },
    /// NBD over TCP on the hypervisor host
    Tcp { name: String, port: u16, tls: bool },
}

impl Transport {
    /// Local socket for a local hypervisor, TCP on the hypervisor host
    /// otherwise.
    pub fn for_connection(remote_host: Option<&str>, config: &ExportConfig) -> Self {
        match remote_host {
            None => Transport::Unix {
                socket: config.socket.clone(),
            },
            Some(host) => Transport::Tcp {
                name: config.address.clone().unwrap_or_else(|| host.to_string()),
                port: config.port,
                tls: config.tls,
            },
        }
    }
}

/// Per-disk entry of an export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDisk {
    pub target: String,
    pub scratch: PathBuf,
    /// Bitmap exported alongside the data (the candidate checkpoint)
    pub export_bitmap: Option<String>,
    /// Checkpoint changes are computed against
    pub incremental: Option<String>,
    /// Copied in full although the export is incremental. Such a disk must
    /// not inherit the request-level anchor.
    pub full: bool,
}

/// Backup description submitted to the hypervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub transport: Transport,
    /// Present only for a real incremental relationship
    pub incremental: Option<String>,
    pub disks: Vec<ExportDisk>,
}

impl ExportRequest {
    pub fn is_incremental(&self) -> bool {
        self.incremental.is_some()
    }
}

/// Builds [`ExportRequest`]s
#[derive(Debug, Clone)]
pub struct ExportRequestBuilder {
    transport: Transport,
    scratch_dir: PathBuf,
    checkpoint: Option<String>,
    anchor: Option<String>,
    covered: Option<HashSet<String>>,
}

impl ExportRequestBuilder {
    pub fn new(transport: Transport, scratch_dir: &Path) -> Self {
        Self {
            transport,
            scratch_dir: scratch_dir.to_path_buf(),
            checkpoint: None,
            anchor: None,
            covered: None,
        }
    }

    /// Export checkpoint `name`, incremental to `anchor` if one was resolved.
    pub fn checkpoint(mut self, name: &str, anchor: Option<&str>) -> Self {
        self.checkpoint = Some(name.to_string());
        self.anchor = anchor.map(str::to_string);
        self
    }

    /// Restrict bitmap attributes to disks the checkpoint covers
    pub fn covered_disks(mut self, disks: &[String]) -> Self {
        self.covered = Some(disks.iter().cloned().collect());
        self
    }

    /// Anchor that differs from the exported checkpoint, if any
    fn incremental_anchor(&self) -> Option<&str> {
        let anchor = self.anchor.as_deref()?;
        match self.checkpoint.as_deref() {
            Some(name) if name != anchor => Some(anchor),
            _ => None,
        }
    }

    fn carries_bitmap(&self, disk: &DomainDisk) -> bool {
        disk.tracks_checkpoints()
            && self
                .covered
                .as_ref()
                .map_or(true, |covered| covered.contains(&disk.target))
    }

    pub fn build<R: Rng + ?Sized>(&self, disks: &[DomainDisk], rng: &mut R) -> ExportRequest {
        let anchor = self.incremental_anchor();

        let disks = disks
            .iter()
            .map(|disk| {
                let scratch = scratch_path(&self.scratch_dir, &disk.target, &mut *rng);
                debug!("Using scratch file: {}", scratch.display());

                let (export_bitmap, incremental) = match (anchor, &self.checkpoint) {
                    (Some(anchor), Some(name)) if self.carries_bitmap(disk) => {
                        (Some(name.clone()), Some(anchor.to_string()))
                    }
                    _ => (None, None),
                };

                let full = anchor.is_some() && incremental.is_none();
                if full {
                    debug!("Disk [{}] has no bitmap, exporting it in full", disk.target);
                }

                ExportDisk {
                    target: disk.target.clone(),
                    scratch,
                    export_bitmap,
                    incremental,
                    full,
                }
            })
            .collect();

        ExportRequest {
            transport: self.transport.clone(),
            incremental: anchor.map(str::to_string),
            disks,
        }
    }
}

/// `<scratch_dir>/backup.<random>.<target>`
pub fn scratch_path<R: Rng + ?Sized>(scratch_dir: &Path, target: &str, rng: &mut R) -> PathBuf {
    let id: String = rng
        .sample_iter(&Alphanumeric)
        .take(SCRATCH_ID_LEN)
        .map(char::from)
        .collect();
    scratch_dir.join(format!("backup.{}.{}", id, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{AttachmentKind, DeviceKind};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn disk(target: &str, format: &str) -> DomainDisk {
        DomainDisk {
            target: target.to_string(),
            format: format.to_string(),
            source_path: PathBuf::from(format!("/images/{}", target)),
            device: DeviceKind::Disk,
            attachment: AttachmentKind::File,
        }
    }

    fn unix() -> Transport {
        Transport::Unix {
            socket: PathBuf::from("/var/tmp/vircpt.sock"),
        }
    }

    #[test]
    fn test_transport_selection() {
        let config = ExportConfig::default();
        assert_eq!(
            Transport::for_connection(None, &config),
            Transport::Unix {
                socket: config.socket.clone()
            }
        );
        assert_eq!(
            Transport::for_connection(Some("kvm02"), &config),
            Transport::Tcp {
                name: "kvm02".to_string(),
                port: config.port,
                tls: false,
            }
        );

        let config = ExportConfig {
            address: Some("10.0.0.2".to_string()),
            tls: true,
            ..ExportConfig::default()
        };
        assert!(matches!(
            Transport::for_connection(Some("kvm02"), &config),
            Transport::Tcp { name, tls: true, .. } if name == "10.0.0.2"
        ));
    }

    #[test]
    fn test_full_export_has_no_incremental_fields() {
        let mut rng = StdRng::seed_from_u64(7);
        let request = ExportRequestBuilder::new(unix(), Path::new("/var/tmp"))
            .checkpoint("cpt1", None)
            .build(&[disk("sda", "qcow2")], &mut rng);

        assert!(!request.is_incremental());
        assert_eq!(request.disks[0].export_bitmap, None);
        assert_eq!(request.disks[0].incremental, None);
        assert!(!request.disks[0].full);
    }

    #[test]
    fn test_anchor_equal_to_candidate_is_full_export() {
        let mut rng = StdRng::seed_from_u64(7);
        let request = ExportRequestBuilder::new(unix(), Path::new("/var/tmp"))
            .checkpoint("cpt1", Some("cpt1"))
            .build(&[disk("sda", "qcow2"), disk("sdb", "qcow2")], &mut rng);

        assert_eq!(request.incremental, None);
        assert!(request
            .disks
            .iter()
            .all(|d| d.export_bitmap.is_none() && d.incremental.is_none()));
    }

    #[test]
    fn test_incremental_export() {
        let mut rng = StdRng::seed_from_u64(7);
        let request = ExportRequestBuilder::new(unix(), Path::new("/var/tmp"))
            .checkpoint("cpt2", Some("cpt1"))
            .build(&[disk("sda", "qcow2"), disk("sdb", "raw")], &mut rng);

        assert_eq!(request.incremental.as_deref(), Some("cpt1"));
        assert_eq!(request.disks[0].export_bitmap.as_deref(), Some("cpt2"));
        assert_eq!(request.disks[0].incremental.as_deref(), Some("cpt1"));
        assert!(!request.disks[0].full);
        // raw disks join crash-consistently, without a bitmap
        assert_eq!(request.disks[1].export_bitmap, None);
        assert_eq!(request.disks[1].incremental, None);
        assert!(request.disks[1].full);
    }

    #[test]
    fn test_bitmaps_limited_to_covered_disks() {
        let mut rng = StdRng::seed_from_u64(7);
        let request = ExportRequestBuilder::new(unix(), Path::new("/var/tmp"))
            .checkpoint("cpt2", Some("cpt1"))
            .covered_disks(&["sdb".to_string()])
            .build(&[disk("sda", "qcow2"), disk("sdb", "qcow2")], &mut rng);

        assert_eq!(request.disks[0].export_bitmap, None);
        assert!(request.disks[0].full);
        assert_eq!(request.disks[1].export_bitmap.as_deref(), Some("cpt2"));
        assert!(!request.disks[1].full);
    }

    #[test]
    fn test_scratch_path_layout() {
        let mut rng = StdRng::seed_from_u64(1);
        let path = scratch_path(Path::new("/var/tmp"), "sda", &mut rng);
        let name = path.file_name().unwrap().to_str().unwrap();
        let parts: Vec<&str> = name.split('.').collect();

        assert_eq!(path.parent(), Some(Path::new("/var/tmp")));
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "backup");
        assert_eq!(parts[1].len(), SCRATCH_ID_LEN);
        assert!(parts[1].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(parts[2], "sda");
    }

    #[test]
    fn test_scratch_paths_distinct_across_sessions() {
        let disks = vec![disk("sda", "qcow2"), disk("sdb", "qcow2")];
        let builder = ExportRequestBuilder::new(unix(), Path::new("/var/tmp"));

        let first = builder.build(&disks, &mut StdRng::seed_from_u64(1));
        let second = builder.build(&disks, &mut StdRng::seed_from_u64(2));

        let mut seen = HashSet::new();
        for d in first.disks.iter().chain(second.disks.iter()) {
            assert!(seen.insert(d.scratch.clone()), "duplicate {:?}", d.scratch);
        }
    }
}
