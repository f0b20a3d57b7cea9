//! Disk eligibility for checkpoint and backup participation.
//!
//! A domain's configuration is parsed into [`DiskSpec`] records, which the
//! classifier filters into the ordered list of [`DomainDisk`]s that take part
//! in a backup. A failure on one disk never stops classification of the rest.

use crate::hypervisor::{Domain, Hypervisor};
use crate::utils::errors::{Result, VircptError};
use crate::xml;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Storage format that cannot carry a change-tracking bitmap
pub const RAW_FORMAT: &str = "raw";

/// Device kind of a disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Disk,
    Cdrom,
    Floppy,
    Lun,
}

impl DeviceKind {
    /// Parse the `device` attribute; libvirt defaults to `disk`.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("cdrom") => DeviceKind::Cdrom,
            Some("floppy") => DeviceKind::Floppy,
            Some("lun") => DeviceKind::Lun,
            _ => DeviceKind::Disk,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Disk => "disk",
            DeviceKind::Cdrom => "cdrom",
            DeviceKind::Floppy => "floppy",
            DeviceKind::Lun => "lun",
        }
    }
}

/// How a disk is attached to its backing storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    File,
    Block,
    Volume,
}

/// Backing storage of a disk as written in the domain configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSource {
    File(PathBuf),
    Block(PathBuf),
    Volume { pool: String, volume: String },
    /// Attachment type this tool cannot resolve (network, nvme, ...)
    Unsupported(String),
}

/// One `<disk>` entry from a domain configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub target: String,
    pub format: String,
    pub device: DeviceKind,
    /// `None` when the entry names no source at all (e.g. an empty tray)
    pub source: Option<DiskSource>,
}

/// Disk selected for backup participation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDisk {
    pub target: String,
    pub format: String,
    pub source_path: PathBuf,
    pub device: DeviceKind,
    pub attachment: AttachmentKind,
}

impl DomainDisk {
    /// Whether the disk can hold a checkpoint bitmap
    pub fn tracks_checkpoints(&self) -> bool {
        self.format != RAW_FORMAT
    }
}

/// Caller-supplied disk selection
#[derive(Debug, Clone, Default)]
pub struct DiskFilter {
    /// Disk targets to leave out
    pub exclude: Vec<String>,
    /// Only consider this disk target
    pub include: Option<String>,
    /// Admit raw passthrough: LUNs, block devices and raw-format images.
    /// Such disks join the backup crash-consistently but never the
    /// checkpoint's disk list.
    pub raw: bool,
}

impl DiskFilter {
    /// Build a filter from a comma separated exclude list
    pub fn new(exclude: Option<&str>, include: Option<String>, raw: bool) -> Self {
        let exclude = exclude
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            exclude,
            include,
            raw,
        }
    }
}

/// Fetch a domain's configuration and classify its disks.
pub async fn domain_disks(
    hv: &dyn Hypervisor,
    domain: &Domain,
    filter: &DiskFilter,
) -> Result<Vec<DomainDisk>> {
    let config = hv.domain_config(domain).await?;
    let specs = xml::parse_domain_disks(&config)?;
    Ok(classify(hv, specs, filter).await)
}

/// Filter disk specs down to the disks eligible for backup.
pub async fn classify(hv: &dyn Hypervisor, specs: Vec<DiskSpec>, filter: &DiskFilter) -> Vec<DomainDisk> {
    let mut disks = Vec::with_capacity(specs.len());

    for spec in specs {
        match admit(hv, spec, filter).await {
            Ok(Some(disk)) => disks.push(disk),
            Ok(None) => {}
            Err(e) => error!("{}", e),
        }
    }

    debug!(
        "Device list: {:?}",
        disks.iter().map(|d| d.target.as_str()).collect::<Vec<_>>()
    );
    disks
}

/// Apply the eligibility rules to one disk, in precedence order.
async fn admit(hv: &dyn Hypervisor, spec: DiskSpec, filter: &DiskFilter) -> Result<Option<DomainDisk>> {
    let dev = spec.target.as_str();

    if filter.exclude.iter().any(|e| e == dev) {
        warn!("Excluding disk [{}] from operation as requested", dev);
        return Ok(None);
    }

    match spec.device {
        DeviceKind::Cdrom | DeviceKind::Floppy => {
            info!("Excluding attached [{}] device: [{}].", spec.device.as_str(), dev);
            return Ok(None);
        }
        DeviceKind::Lun if !filter.raw => {
            warn!("Excluding direct attached lun [{}], use option --raw to include.", dev);
            return Ok(None);
        }
        _ => {}
    }

    if matches!(spec.source, Some(DiskSource::Block(_))) && !filter.raw {
        warn!(
            "Skipping direct attached block device [{}], use option --raw to include.",
            dev
        );
        return Ok(None);
    }

    if spec.format == RAW_FORMAT && !filter.raw {
        warn!("Excluding unsupported raw disk [{}].", dev);
        return Ok(None);
    }

    let (source_path, attachment) = match spec.source {
        Some(DiskSource::File(path)) => {
            debug!("Disk [{}]: file notation", dev);
            (path, AttachmentKind::File)
        }
        Some(DiskSource::Block(path)) => {
            debug!("Disk [{}]: block notation", dev);
            (path, AttachmentKind::Block)
        }
        Some(DiskSource::Volume { pool, volume }) => {
            debug!("Disk [{}]: volume notation", dev);
            let path = hv
                .volume_path(&pool, &volume)
                .await
                .map_err(|e| VircptError::DiskResolution {
                    target: dev.to_string(),
                    reason: format!("failed to detect disk by volume: {}", e),
                })?;
            (PathBuf::from(path), AttachmentKind::Volume)
        }
        Some(DiskSource::Unsupported(kind)) => {
            return Err(VircptError::DiskResolution {
                target: dev.to_string(),
                reason: format!("unable to detect disk volume type [{}]", kind),
            });
        }
        None => {
            return Err(VircptError::DiskResolution {
                target: dev.to_string(),
                reason: "unable to detect disk source".to_string(),
            });
        }
    };

    if let Some(include) = &filter.include {
        if include != dev {
            info!(
                "Skipping disk: [{}] as requested: does not match disk [{}]",
                dev, include
            );
            return Ok(None);
        }
    }

    Ok(Some(DomainDisk {
        target: spec.target,
        format: spec.format,
        source_path,
        device: spec.device,
        attachment,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::MockHypervisor;

    fn file_disk(target: &str, format: &str) -> DiskSpec {
        DiskSpec {
            target: target.to_string(),
            format: format.to_string(),
            device: DeviceKind::Disk,
            source: Some(DiskSource::File(PathBuf::from(format!("/images/{}.img", target)))),
        }
    }

    fn targets(disks: &[DomainDisk]) -> Vec<&str> {
        disks.iter().map(|d| d.target.as_str()).collect()
    }

    #[tokio::test]
    async fn test_removable_media_always_excluded() {
        let hv = MockHypervisor::new();
        let mut cdrom = file_disk("sdc", "raw");
        cdrom.device = DeviceKind::Cdrom;
        let mut floppy = file_disk("fda", "qcow2");
        floppy.device = DeviceKind::Floppy;

        let filter = DiskFilter {
            raw: true,
            ..DiskFilter::default()
        };
        let disks = classify(&hv, vec![file_disk("sda", "qcow2"), cdrom, floppy], &filter).await;
        assert_eq!(targets(&disks), vec!["sda"]);
    }

    #[tokio::test]
    async fn test_raw_passthrough_requires_flag() {
        let hv = MockHypervisor::new();
        let mut lun = file_disk("sdd", "raw");
        lun.device = DeviceKind::Lun;
        let block = DiskSpec {
            target: "sde".to_string(),
            format: "qcow2".to_string(),
            device: DeviceKind::Disk,
            source: Some(DiskSource::Block(PathBuf::from("/dev/sde"))),
        };
        let specs = vec![file_disk("sda", "qcow2"), file_disk("sdb", "raw"), lun, block];

        let disks = classify(&hv, specs.clone(), &DiskFilter::default()).await;
        assert_eq!(targets(&disks), vec!["sda"]);

        let filter = DiskFilter {
            raw: true,
            ..DiskFilter::default()
        };
        let disks = classify(&hv, specs, &filter).await;
        assert_eq!(targets(&disks), vec!["sda", "sdb", "sdd", "sde"]);
        assert_eq!(disks[3].attachment, AttachmentKind::Block);
        assert!(!disks[1].tracks_checkpoints());
    }

    #[tokio::test]
    async fn test_exclude_and_include_filters() {
        let hv = MockHypervisor::new();
        let specs = vec![file_disk("sda", "qcow2"), file_disk("sdb", "qcow2"), file_disk("sdc", "qcow2")];

        let filter = DiskFilter::new(Some("sdb, sdc"), None, false);
        assert_eq!(targets(&classify(&hv, specs.clone(), &filter).await), vec!["sda"]);

        let filter = DiskFilter::new(None, Some("sdb".to_string()), false);
        assert_eq!(targets(&classify(&hv, specs.clone(), &filter).await), vec!["sdb"]);

        // exclusion wins over inclusion
        let filter = DiskFilter::new(Some("sdb"), Some("sdb".to_string()), false);
        assert!(classify(&hv, specs, &filter).await.is_empty());
    }

    #[tokio::test]
    async fn test_volume_resolution_failure_is_not_fatal() {
        let hv = MockHypervisor::new().with_volume("default", "vm1-disk0.qcow2", "/pool/vm1-disk0.qcow2");
        let volume = |target: &str, name: &str| DiskSpec {
            target: target.to_string(),
            format: "qcow2".to_string(),
            device: DeviceKind::Disk,
            source: Some(DiskSource::Volume {
                pool: "default".to_string(),
                volume: name.to_string(),
            }),
        };
        let unknown = DiskSpec {
            target: "sdx".to_string(),
            format: "qcow2".to_string(),
            device: DeviceKind::Disk,
            source: Some(DiskSource::Unsupported("network".to_string())),
        };
        let sourceless = DiskSpec {
            source: None,
            ..file_disk("sdy", "qcow2")
        };

        let specs = vec![
            volume("sda", "vm1-disk0.qcow2"),
            volume("sdb", "missing.qcow2"),
            unknown,
            sourceless,
            file_disk("sdc", "qcow2"),
        ];
        let disks = classify(&hv, specs, &DiskFilter::default()).await;

        assert_eq!(targets(&disks), vec!["sda", "sdc"]);
        assert_eq!(disks[0].source_path, PathBuf::from("/pool/vm1-disk0.qcow2"));
        assert_eq!(disks[0].attachment, AttachmentKind::Volume);
    }

    #[test]
    fn test_device_kind_parse() {
        assert_eq!(DeviceKind::parse(None), DeviceKind::Disk);
        assert_eq!(DeviceKind::parse(Some("cdrom")), DeviceKind::Cdrom);
        assert_eq!(DeviceKind::parse(Some("lun")), DeviceKind::Lun);
    }
}
