//! Collaborator interfaces consumed by the cache builder
//!
//! Module resolution, trust policy, linking and archiving are external
//! concerns. The builder only sequences them.

use crate::container::ArchId;
use crate::error::BootcacheResult;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

/// A module bundle selected for inclusion
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleRef {
    pub path: PathBuf,
}

impl ModuleRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Bundle name without its directory
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Outcome of a module signature check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureResult {
    Valid,
    Invalid,
    Unsigned,
}

/// Chooses the modules to include from a set of directories
pub trait ModuleResolver: Send + Sync {
    fn resolve_modules(&self, dirs: &[PathBuf], flags: &[String]) -> BootcacheResult<Vec<ModuleRef>>;
}

/// Decides whether a module may be included
pub trait TrustPolicy: Send + Sync {
    fn is_authentic(&self, module: &ModuleRef) -> bool;

    fn signature(&self, module: &ModuleRef) -> SignatureResult;
}

/// Links a kernel image with modules into one architecture's slice
#[async_trait]
pub trait Linker: Send + Sync {
    async fn link_kernel(
        &self,
        kernel: &Path,
        modules: &[ModuleRef],
        arch: ArchId,
    ) -> BootcacheResult<Vec<u8>>;
}

/// Packs modules into one architecture's archive slice
#[async_trait]
pub trait Archiver: Send + Sync {
    async fn archive_modules(
        &self,
        modules: &[ModuleRef],
        arch: ArchId,
        compress: bool,
    ) -> BootcacheResult<Vec<u8>>;
}

/// Per-architecture progress callbacks
pub trait BuildObserver: Send + Sync {
    fn arch_started(&self, _arch: ArchId, _index: usize, _total: usize) {}

    fn arch_finished(&self, _arch: ArchId, _reused: bool) {}
}

/// Observer that ignores everything
pub struct Silent;

impl BuildObserver for Silent {}
