//! Configuration management for vircpt.
//!
//! Loads configuration from a TOML file; command-line flags override
//! individual values.

use crate::utils::errors::{Result, VircptError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Libvirt connection URI
    #[serde(default = "default_uri")]
    pub uri: String,

    /// virsh client binary
    #[serde(default = "default_virsh")]
    pub virsh: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Directory for the hypervisor's scratch files
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// NBD socket used when the hypervisor is local
    #[serde(default = "default_socket")]
    pub socket: PathBuf,

    /// NBD listen address for remote hypervisors (default: hypervisor host)
    #[serde(default)]
    pub address: Option<String>,

    /// NBD listen port for remote hypervisors
    #[serde(default = "default_port")]
    pub port: u16,

    /// Require TLS on the remote NBD server
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_uri() -> String {
    "qemu:///system".to_string()
}

fn default_virsh() -> PathBuf {
    PathBuf::from("virsh")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/var/tmp")
}

fn default_socket() -> PathBuf {
    PathBuf::from("/var/tmp/vircpt.sock")
}

fn default_port() -> u16 {
    10809
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            virsh: default_virsh(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            socket: default_socket(),
            address: None,
            port: default_port(),
            tls: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| VircptError::Config(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.connection.uri, "qemu:///system");
        assert_eq!(config.export.scratch_dir, PathBuf::from("/var/tmp"));
        assert_eq!(config.export.port, 10809);
        assert!(!config.export.tls);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_partial_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("vircpt.toml");
        fs::write(
            &path,
            "[connection]\nuri = \"qemu+ssh://root@kvm02/system\"\n\n[export]\ntls = true\nport = 10900\n",
        )?;

        let config = Config::from_file(&path)?;
        assert_eq!(config.connection.uri, "qemu+ssh://root@kvm02/system");
        assert_eq!(config.connection.virsh, PathBuf::from("virsh"));
        assert!(config.export.tls);
        assert_eq!(config.export.port, 10900);
        assert_eq!(config.export.socket, PathBuf::from("/var/tmp/vircpt.sock"));
        Ok(())
    }

    #[test]
    fn test_invalid_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("broken.toml");
        fs::write(&path, "[export]\nport = \"not a number\"\n")?;

        assert!(matches!(Config::from_file(&path), Err(VircptError::Config(_))));
        Ok(())
    }
}
