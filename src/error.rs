//! Error types for bootcache
//!
//! All modules use `BootcacheResult<T>` as their return type. The container
//! codec and the volume lock keep their own error enums and convert into
//! `BootcacheError` at the module boundary.

use crate::container::ContainerError;
use crate::lock::LockError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for bootcache operations
pub type BootcacheResult<T> = Result<T, BootcacheError>;

/// Exit status for "stale, retry later" (sysexits `EX_TEMPFAIL`)
pub const EXIT_STALE: u8 = 75;

/// Exit status for untrusted or malformed input (sysexits `EX_DATAERR`)
pub const EXIT_DATAERR: u8 = 65;

/// All errors that can occur in bootcache
#[derive(Error, Debug)]
pub enum BootcacheError {
    // Manifest errors
    #[error("Untrusted manifest {path}: {reason}")]
    UntrustedManifest { path: PathBuf, reason: String },

    #[error("Unsupported manifest shape in {path}: {reason}")]
    UnsupportedManifestShape { path: PathBuf, reason: String },

    #[error("Stamp directory {path} is not on the same volume as its manifest")]
    CrossVolume { path: PathBuf },

    // Staleness errors
    #[error("Cannot evaluate {category} entry {path}: {source}")]
    Evaluate {
        category: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No captured timestamps for {0}; evaluate before commit")]
    NotEvaluated(PathBuf),

    // Build errors
    #[error("Sources changed during build; {path} not installed")]
    Stale { path: PathBuf },

    #[error("Artifact for {arch} is {size} bytes, over the {limit} byte limit")]
    ArtifactTooLarge { arch: String, size: u64, limit: u64 },

    #[error("Link failed for {arch}: {reason}")]
    Link { arch: String, reason: String },

    #[error("Archive failed for {arch}: {reason}")]
    Archive { arch: String, reason: String },

    #[error("No {tool} configured; set [tools].{tool} in the config file")]
    ToolNotConfigured { tool: String },

    #[error("Unknown architecture: {0}")]
    UnknownArch(String),

    #[error("Artifact {0} has no architectures to build")]
    NoArchs(PathBuf),

    // Container and lock errors
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Volume lock error: {0}")]
    Lock(#[from] LockError),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Invalid path: {path}: {reason}")]
    PathInvalid { path: PathBuf, reason: String },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BootcacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Stale { .. } | Self::Lock(LockError::Timeout { .. })
        )
    }

    /// Check if this is the non-fatal "sources moved during build" outcome
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::UntrustedManifest { .. } => {
                Some("The manifest must be owned by root and not writable by group or other")
            }
            Self::Lock(LockError::Timeout { .. }) => {
                Some("Another process is rebuilding this volume; retry later")
            }
            Self::Stale { .. } => Some("Sources changed while building; run the update again"),
            Self::ToolNotConfigured { .. } => Some("Run: bootcache config path"),
            _ => None,
        }
    }

    /// Map onto the process exit status taxonomy
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Stale { .. } => EXIT_STALE,
            Self::UntrustedManifest { .. }
            | Self::UnsupportedManifestShape { .. }
            | Self::Container(_) => EXIT_DATAERR,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn error_display() {
        let err = BootcacheError::ArtifactTooLarge {
            arch: "ppc".to_string(),
            size: 20,
            limit: 10,
        };
        assert!(err.to_string().contains("over the 10 byte limit"));
    }

    #[test]
    fn error_hint() {
        let err = BootcacheError::UntrustedManifest {
            path: "/usr/standalone/bootcaches.toml".into(),
            reason: "not owned by root".to_string(),
        };
        assert!(err.hint().unwrap().contains("owned by root"));
    }

    #[test]
    fn error_retryable() {
        let stale = BootcacheError::Stale {
            path: "/kernelcache".into(),
        };
        assert!(stale.is_retryable());
        assert!(stale.is_stale());

        let timeout = BootcacheError::Lock(LockError::Timeout {
            volume: "Macintosh HD".to_string(),
            waited: Duration::from_secs(300),
        });
        assert!(timeout.is_retryable());
        assert!(!BootcacheError::Internal("x".into()).is_retryable());
    }

    #[test]
    fn exit_codes() {
        let stale = BootcacheError::Stale {
            path: "/mkext".into(),
        };
        assert_eq!(stale.exit_code(), EXIT_STALE);

        let shape = BootcacheError::UnsupportedManifestShape {
            path: "/m".into(),
            reason: "unknown key".into(),
        };
        assert_eq!(shape.exit_code(), EXIT_DATAERR);
        assert_eq!(BootcacheError::Internal("x".into()).exit_code(), 1);
    }
}
