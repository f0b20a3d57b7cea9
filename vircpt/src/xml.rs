//! Hypervisor description documents.
//!
//! Serializes export and checkpoint-creation requests into libvirt's
//! `domainbackup` / `domaincheckpoint` markup and parses the parts of domain
//! and checkpoint configuration this crate needs.

use crate::checkpoint::{Checkpoint, CheckpointRequest};
use crate::disk::{DeviceKind, DiskSource, DiskSpec, RAW_FORMAT};
use crate::export::{ExportRequest, Transport};
use crate::hypervisor::HypervisorError;
use chrono::DateTime;
use quick_xml::se::Serializer;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Serialize)]
struct BackupDocument<'a> {
    #[serde(rename = "@mode")]
    mode: &'static str,
    server: ServerElement<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    incremental: Option<&'a str>,
    disks: BackupDisks<'a>,
}

#[derive(Serialize)]
struct ServerElement<'a> {
    #[serde(rename = "@transport")]
    transport: &'static str,
    #[serde(rename = "@socket", skip_serializing_if = "Option::is_none")]
    socket: Option<String>,
    #[serde(rename = "@name", skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(rename = "@port", skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(rename = "@tls", skip_serializing_if = "Option::is_none")]
    tls: Option<&'static str>,
}

#[derive(Serialize)]
struct BackupDisks<'a> {
    disk: Vec<BackupDisk<'a>>,
}

#[derive(Serialize)]
struct BackupDisk<'a> {
    #[serde(rename = "@name")]
    name: &'a str,
    #[serde(rename = "@exportbitmap", skip_serializing_if = "Option::is_none")]
    export_bitmap: Option<&'a str>,
    #[serde(rename = "@incremental", skip_serializing_if = "Option::is_none")]
    incremental: Option<&'a str>,
    #[serde(rename = "@backupmode", skip_serializing_if = "Option::is_none")]
    backup_mode: Option<&'static str>,
    scratch: ScratchElement,
}

#[derive(Serialize)]
struct ScratchElement {
    #[serde(rename = "@file")]
    file: String,
}

/// Serialize an export request as a pull-mode `domainbackup` document.
pub fn backup_document(request: &ExportRequest) -> Result<String, HypervisorError> {
    let server = match &request.transport {
        Transport::Unix { socket } => ServerElement {
            transport: "unix",
            socket: Some(socket.display().to_string()),
            name: None,
            port: None,
            tls: None,
        },
        Transport::Tcp { name, port, tls } => ServerElement {
            transport: "tcp",
            socket: None,
            name: Some(name.as_str()),
            port: Some(*port),
            tls: tls.then_some("yes"),
        },
    };

    let document = BackupDocument {
        mode: "pull",
        server,
        incremental: request.incremental.as_deref(),
        disks: BackupDisks {
            disk: request
                .disks
                .iter()
                .map(|d| BackupDisk {
                    name: &d.target,
                    export_bitmap: d.export_bitmap.as_deref(),
                    incremental: d.incremental.as_deref(),
                    // overrides the document-level <incremental> for this disk
                    backup_mode: d.full.then_some("full"),
                    scratch: ScratchElement {
                        file: d.scratch.display().to_string(),
                    },
                })
                .collect(),
        },
    };

    to_document("domainbackup", &document)
}

#[derive(Serialize)]
struct CheckpointCreateDocument<'a> {
    description: &'a str,
    name: &'a str,
    disks: CheckpointCreateDisks<'a>,
}

#[derive(Serialize)]
struct CheckpointCreateDisks<'a> {
    disk: Vec<NamedDisk<'a>>,
}

#[derive(Serialize)]
struct NamedDisk<'a> {
    #[serde(rename = "@name")]
    name: &'a str,
}

/// Serialize a checkpoint creation request as a `domaincheckpoint` document.
pub fn checkpoint_document(request: &CheckpointRequest) -> Result<String, HypervisorError> {
    let document = CheckpointCreateDocument {
        description: &request.description,
        name: &request.name,
        disks: CheckpointCreateDisks {
            disk: request
                .disks
                .iter()
                .map(|name| NamedDisk { name: name.as_str() })
                .collect(),
        },
    };

    to_document("domaincheckpoint", &document)
}

fn to_document<T: Serialize>(root: &str, value: &T) -> Result<String, HypervisorError> {
    let mut out = String::new();
    let mut serializer =
        Serializer::with_root(&mut out, Some(root)).map_err(|e| HypervisorError::Xml(e.to_string()))?;
    serializer.indent(' ', 2);
    value
        .serialize(serializer)
        .map_err(|e| HypervisorError::Xml(e.to_string()))?;
    Ok(out)
}

#[derive(Deserialize)]
struct DomainDocument {
    #[serde(default)]
    devices: DevicesElement,
}

#[derive(Deserialize, Default)]
struct DevicesElement {
    #[serde(rename = "disk", default)]
    disks: Vec<DiskElement>,
}

#[derive(Deserialize)]
struct DiskElement {
    #[serde(rename = "@type", default)]
    kind: Option<String>,
    #[serde(rename = "@device", default)]
    device: Option<String>,
    driver: Option<DriverElement>,
    source: Option<SourceElement>,
    target: TargetElement,
}

#[derive(Deserialize)]
struct DriverElement {
    #[serde(rename = "@type", default)]
    format: Option<String>,
}

#[derive(Deserialize, Default)]
struct SourceElement {
    #[serde(rename = "@file", default)]
    file: Option<String>,
    #[serde(rename = "@dev", default)]
    dev: Option<String>,
    #[serde(rename = "@pool", default)]
    pool: Option<String>,
    #[serde(rename = "@volume", default)]
    volume: Option<String>,
}

#[derive(Deserialize)]
struct TargetElement {
    #[serde(rename = "@dev")]
    dev: String,
}

/// Parse the `<disk>` entries of a domain configuration document.
///
/// A disk without a driver format is treated as raw, matching the
/// hypervisor's default.
pub fn parse_domain_disks(config: &str) -> Result<Vec<DiskSpec>, HypervisorError> {
    let document: DomainDocument =
        quick_xml::de::from_str(config).map_err(|e| HypervisorError::Xml(e.to_string()))?;

    Ok(document
        .devices
        .disks
        .into_iter()
        .map(|disk| {
            let kind = disk.kind.unwrap_or_else(|| "file".to_string());
            let src = disk.source.unwrap_or_default();
            let source = match kind.as_str() {
                "file" => src.file.map(|f| DiskSource::File(PathBuf::from(f))),
                "block" => src.dev.map(|d| DiskSource::Block(PathBuf::from(d))),
                "volume" => match (src.pool, src.volume) {
                    (Some(pool), Some(volume)) => Some(DiskSource::Volume { pool, volume }),
                    _ => None,
                },
                other => Some(DiskSource::Unsupported(other.to_string())),
            };

            DiskSpec {
                target: disk.target.dev,
                format: disk
                    .driver
                    .and_then(|d| d.format)
                    .unwrap_or_else(|| RAW_FORMAT.to_string()),
                device: DeviceKind::parse(disk.device.as_deref()),
                source,
            }
        })
        .collect())
}

#[derive(Deserialize)]
struct CheckpointDocument {
    name: String,
    parent: Option<ParentElement>,
    #[serde(rename = "creationTime")]
    creation_time: Option<i64>,
    disks: Option<CheckpointDisks>,
}

#[derive(Deserialize)]
struct ParentElement {
    name: String,
}

#[derive(Deserialize)]
struct CheckpointDisks {
    #[serde(rename = "disk", default)]
    disks: Vec<CheckpointDisk>,
}

#[derive(Deserialize)]
struct CheckpointDisk {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@checkpoint", default)]
    checkpoint: Option<String>,
}

/// Parse a `domaincheckpoint` description. Disks marked
/// `checkpoint="no"` are not covered by the checkpoint.
pub fn parse_checkpoint(description: &str) -> Result<Checkpoint, HypervisorError> {
    let document: CheckpointDocument =
        quick_xml::de::from_str(description).map_err(|e| HypervisorError::Xml(e.to_string()))?;

    let disks = document
        .disks
        .map(|d| d.disks)
        .unwrap_or_default()
        .into_iter()
        .filter(|d| d.checkpoint.as_deref() != Some("no"))
        .map(|d| d.name)
        .collect();

    Ok(Checkpoint {
        name: document.name,
        parent: document.parent.map(|p| p.name),
        creation_time: document
            .creation_time
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        disks,
    })
}
