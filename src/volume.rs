//! Volume identity
//!
//! A volume is addressed by its mount root. Its identity (a stable UUID plus
//! a human-readable label) keys both the stamp directory and the volume lock.

use crate::error::{BootcacheError, BootcacheResult};
use nix::sys::statvfs::{statvfs, FsFlags};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Namespace for UUIDs derived from device numbers
const DEVICE_NAMESPACE: Uuid = Uuid::from_u128(0x6b1d_2a38_1c7e_4f0b_9a55_3e2f_8d40_c911);

/// Stable identity of one volume
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeIdentity {
    pub uuid: Uuid,
    pub label: String,
}

impl VolumeIdentity {
    pub fn new(uuid: Uuid, label: impl Into<String>) -> Self {
        Self {
            uuid,
            label: label.into(),
        }
    }

    /// Identity derived from a device number
    pub fn for_device(device: u64, label: impl Into<String>) -> Self {
        let name = format!("device:{}", device);
        Self::new(Uuid::new_v5(&DEVICE_NAMESPACE, name.as_bytes()), label)
    }

    /// Upper-case hyphenated form used in stamp paths
    pub fn uuid_string(&self) -> String {
        self.uuid.hyphenated().to_string().to_uppercase()
    }
}

impl fmt::Display for VolumeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.uuid)
    }
}

/// A mounted volume
#[derive(Debug, Clone)]
pub struct Volume {
    pub root: PathBuf,
    pub identity: VolumeIdentity,
    /// Device number of the root directory
    pub device: u64,
}

impl Volume {
    /// Stat `root` and derive its identity
    pub fn probe(root: &Path) -> BootcacheResult<Self> {
        let meta = std::fs::metadata(root).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BootcacheError::PathNotFound(root.to_path_buf())
            } else {
                BootcacheError::io(format!("probing volume {}", root.display()), e)
            }
        })?;
        if !meta.is_dir() {
            return Err(BootcacheError::PathInvalid {
                path: root.to_path_buf(),
                reason: "volume root is not a directory".to_string(),
            });
        }

        let device = meta.dev();
        let identity = VolumeIdentity::for_device(device, default_label(root));
        debug!("Probed volume {} as {}", root.display(), identity);

        Ok(Self {
            root: root.to_path_buf(),
            identity,
            device,
        })
    }

    /// Override the derived identity with explicit values
    pub fn with_identity(mut self, uuid: Option<Uuid>, label: Option<String>) -> Self {
        if let Some(uuid) = uuid {
            self.identity.uuid = uuid;
        }
        if let Some(label) = label {
            self.identity.label = label;
        }
        self
    }

    /// Whether the volume is mounted read-only
    pub fn is_read_only(&self) -> bool {
        match statvfs(&self.root) {
            Ok(stat) => stat.flags().contains(FsFlags::ST_RDONLY),
            Err(e) => {
                debug!("statvfs {} failed: {}", self.root.display(), e);
                false
            }
        }
    }
}

fn default_label(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string())
}
