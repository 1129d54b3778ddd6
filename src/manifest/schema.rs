//! On-disk manifest document
//!
//! Stored at `usr/standalone/bootcaches.toml` on each volume. Every table
//! rejects unknown keys: a manifest written for a newer tool is refused
//! rather than half-understood.

use crate::container::ArchId;
use serde::{Deserialize, Serialize};

/// Root manifest document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestDocument {
    /// Paths read before the booter
    pub preboot: Option<PrebootSection>,

    /// Boot loaders
    pub booters: Option<BootersSection>,

    /// Paths needed after the booter hands off
    pub postboot: Option<PostbootSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrebootSection {
    /// Volume label file shown by the boot picker
    pub label: Option<String>,

    #[serde(default)]
    pub additional_paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootersSection {
    pub efi: Option<String>,
    pub openfirmware: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostbootSection {
    pub boot_config: Option<String>,

    #[serde(default)]
    pub additional_paths: Vec<String>,

    /// Archive of module bundles
    pub mkext: Option<MkextSection>,

    /// Prelinked kernel
    pub kernelcache: Option<KernelCacheSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MkextSection {
    pub path: String,
    pub extensions_dir: String,

    /// Empty means the configured default architectures
    #[serde(default)]
    pub archs: Vec<ArchId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelCacheSection {
    pub path: String,
    pub kernel_path: String,
    pub extensions_dir: String,

    #[serde(default)]
    pub archs: Vec<ArchId>,
}
