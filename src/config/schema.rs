//! Configuration schema for bootcache
//!
//! Stored at `/etc/bootcache/config.toml` for privileged runs, otherwise
//! `~/.config/bootcache/config.toml`.

use crate::container::ArchId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Volume lock client settings
    pub lock: LockConfig,

    /// Artifact build settings
    pub build: BuildConfig,

    /// External linker and archiver
    pub tools: ToolsConfig,

    /// Lock coordinator settings
    pub daemon: DaemonConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Append rebuild, lock and stamp events as JSON lines
    pub event_log: bool,

    /// Event log location (defaults under the state directory)
    pub event_log_path: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            event_log: true,
            event_log_path: None,
        }
    }
}

/// Volume lock client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Coordinator socket
    pub socket_path: PathBuf,

    /// Delay between attempts while a volume is busy
    pub retry_delay_secs: u64,

    /// Attempts after the first `Busy` before giving up
    pub max_retries: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/bootcache.sock"),
            retry_delay_secs: 30,
            max_retries: 10,
        }
    }
}

/// Artifact build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Added to the newest source mtime to form an artifact's stamp time
    pub timestamp_offset_secs: u64,

    /// Architectures built when a manifest entry names none
    pub default_archs: Vec<ArchId>,

    /// Per-architecture archive ceiling in bytes
    pub archive_size_limit: u64,

    /// Overrides of `archive_size_limit` keyed by architecture name
    pub archive_size_limits: BTreeMap<String, u64>,

    /// Pause before building, to let the system settle
    pub idle_wait_secs: u64,

    /// Ask the archiver to compress
    pub compress: bool,

    /// Slice alignment in multi-architecture containers (power of two)
    pub align_log2: u32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            timestamp_offset_secs: 1,
            default_archs: vec![ArchId::host()],
            archive_size_limit: 16 * 1024 * 1024,
            archive_size_limits: BTreeMap::new(),
            idle_wait_secs: 0,
            compress: true,
            align_log2: 0,
        }
    }
}

/// An external program and its leading arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,
}

/// External collaborators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Links a kernel with its modules; writes the slice to stdout
    pub linker: Option<ToolCommand>,

    /// Archives modules; writes the slice to stdout
    pub archiver: Option<ToolCommand>,
}

/// Lock coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Volume roots to watch
    pub watch: Vec<PathBuf>,

    /// Consecutive failed rebuilds before the coordinator stops launching
    pub failure_limit: u32,

    /// Quiet period after a volume change before checking it
    pub settle_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            watch: vec![PathBuf::from("/")],
            failure_limit: 5,
            settle_secs: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[lock]"));
        assert!(toml.contains("timestamp_offset_secs = 1"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.lock.max_retries, 10);
        assert_eq!(config.lock.retry_delay_secs, 30);
        assert_eq!(config.build.archive_size_limit, 16 * 1024 * 1024);
        assert_eq!(config.daemon.failure_limit, 5);
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [build]
            default_archs = ["ppc", "i386"]

            [build.archive_size_limits]
            ppc = 1024

            [tools.archiver]
            program = "/usr/libexec/mkextarchive"
            args = ["-v"]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.build.default_archs.len(), 2);
        assert_eq!(config.build.archive_size_limits["ppc"], 1024);
        assert_eq!(config.build.timestamp_offset_secs, 1); // default preserved
        let archiver = config.tools.archiver.unwrap();
        assert_eq!(archiver.args, vec!["-v"]);
        assert!(config.tools.linker.is_none());
    }
}
