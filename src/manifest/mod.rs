//! Per-volume cache manifest
//!
//! The manifest declares which files on a volume feed the boot caches and
//! which artifacts are derived from them. It is loaded once per volume.
//!
//! # Security Model
//!
//! - The manifest must be owned by the trusted owner (root) and must not be
//!   writable by group or other; otherwise the whole manifest is refused
//! - The descriptor used for the ownership check is the one the contents are
//!   read from, and it stays open for the manifest's lifetime so later
//!   revalidation can prove it is still the same file
//! - Every declared path must be relative and stay inside the volume
//! - The stamp directory must live on the same device as the manifest

pub mod paths;
pub mod schema;

pub use paths::{
    escape_stamp_name, unescape_stamp_name, CachedPath, CapturedTimes, PathCategory, SourceState,
};
pub use schema::ManifestDocument;

use crate::container::ArchId;
use crate::error::{BootcacheError, BootcacheResult};
use crate::volume::Volume;
use paths::validate_relative;
use std::fmt;
use std::fs::{DirBuilder, File};
use std::io::Read;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Manifest location relative to the volume root
pub const MANIFEST_PATH: &str = "usr/standalone/bootcaches.toml";

/// Parent of the per-volume stamp directories
pub const STAMP_ROOT: &str = "System/Library/Caches/com.apple.bootstamps";

/// Owner the manifest must belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestTrust {
    pub owner_uid: u32,
}

impl ManifestTrust {
    /// Trust manifests owned by the invoking user (test volumes, images)
    pub fn current_user() -> Self {
        Self {
            owner_uid: crate::privilege::effective_uid(),
        }
    }
}

impl Default for ManifestTrust {
    fn default() -> Self {
        Self { owner_uid: 0 }
    }
}

/// Kind of derived artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Archive of module bundles, built by the archiver
    Mkext,
    /// Kernel linked with its modules, built by the linker
    KernelCache,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mkext => write!(f, "mkext"),
            Self::KernelCache => write!(f, "kernelcache"),
        }
    }
}

/// A derived artifact declared by the manifest
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactSpec {
    pub kind: ArtifactKind,
    /// Absolute artifact path
    pub path: PathBuf,
    /// Absolute module source directory
    pub extensions_dir: PathBuf,
    /// Absolute kernel image path (kernel caches only)
    pub kernel: Option<PathBuf>,
    /// Declared architectures; empty means the configured defaults
    pub archs: Vec<ArchId>,
}

/// A loaded, trusted manifest
#[derive(Debug)]
pub struct CacheManifest {
    volume: Volume,
    path: PathBuf,
    file: File,
    stamp_dir: PathBuf,
    pub misc: Vec<CachedPath>,
    pub booters: Vec<CachedPath>,
    pub postboot: Vec<CachedPath>,
    pub artifacts: Vec<ArtifactSpec>,
}

impl CacheManifest {
    /// Load the manifest of `volume`, requiring root ownership.
    ///
    /// `Ok(None)` means the volume declares no caches.
    pub fn load(volume: &Volume) -> BootcacheResult<Option<Self>> {
        Self::load_with(volume, ManifestTrust::default())
    }

    /// Load the manifest of `volume` under an explicit trust policy
    pub fn load_with(volume: &Volume, trust: ManifestTrust) -> BootcacheResult<Option<Self>> {
        let path = volume.root.join(MANIFEST_PATH);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No manifest on {}", volume.identity);
                return Ok(None);
            }
            Err(e) => {
                return Err(BootcacheError::io(
                    format!("opening manifest {}", path.display()),
                    e,
                ))
            }
        };

        let meta = file
            .metadata()
            .map_err(|e| BootcacheError::io(format!("inspecting {}", path.display()), e))?;
        check_trust(&path, &meta, trust)?;

        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(|e| BootcacheError::io(format!("reading {}", path.display()), e))?;

        let document: ManifestDocument =
            toml::from_str(&content).map_err(|e| BootcacheError::UnsupportedManifestShape {
                path: path.clone(),
                reason: e.message().to_string(),
            })?;

        let stamp_dir = volume
            .root
            .join(STAMP_ROOT)
            .join(volume.identity.uuid_string());
        let mut manifest = Self {
            volume: volume.clone(),
            path,
            file,
            stamp_dir,
            misc: Vec::new(),
            booters: Vec::new(),
            postboot: Vec::new(),
            artifacts: Vec::new(),
        };
        manifest.populate(document)?;
        manifest.ensure_stamp_dir(meta.dev())?;

        debug!(
            "Loaded manifest for {}: {} misc, {} booter, {} postboot paths",
            manifest.volume.identity,
            manifest.misc.len(),
            manifest.booters.len(),
            manifest.postboot.len()
        );
        Ok(Some(manifest))
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Manifest file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stamp_dir(&self) -> &Path {
        &self.stamp_dir
    }

    /// Declared artifact of a given kind
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&ArtifactSpec> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }

    /// All cached paths with their category
    pub fn entries(&self) -> impl Iterator<Item = (PathCategory, &CachedPath)> {
        self.misc
            .iter()
            .map(|p| (PathCategory::Misc, p))
            .chain(self.booters.iter().map(|p| (PathCategory::Booter, p)))
            .chain(self.postboot.iter().map(|p| (PathCategory::PostBoot, p)))
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = (PathCategory, &mut CachedPath)> {
        self.misc
            .iter_mut()
            .map(|p| (PathCategory::Misc, p))
            .chain(self.booters.iter_mut().map(|p| (PathCategory::Booter, p)))
            .chain(self.postboot.iter_mut().map(|p| (PathCategory::PostBoot, p)))
    }

    /// Whether `path` is still the file this manifest was read from
    pub fn is_same_file(&self, path: &Path) -> BootcacheResult<bool> {
        let held = self
            .file
            .metadata()
            .map_err(|e| BootcacheError::io("inspecting held manifest", e))?;
        match std::fs::metadata(path) {
            Ok(meta) => Ok(meta.dev() == held.dev() && meta.ino() == held.ino()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BootcacheError::io(
                format!("inspecting {}", path.display()),
                e,
            )),
        }
    }

    fn populate(&mut self, document: ManifestDocument) -> BootcacheResult<()> {
        if let Some(preboot) = document.preboot {
            for raw in preboot.label.iter().chain(&preboot.additional_paths) {
                let entry = self.cached(raw)?;
                self.misc.push(entry);
            }
        }

        if let Some(booters) = document.booters {
            for raw in booters.efi.iter().chain(&booters.openfirmware) {
                let entry = self.cached(raw)?;
                self.booters.push(entry);
            }
        }

        if let Some(postboot) = document.postboot {
            for raw in postboot.boot_config.iter().chain(&postboot.additional_paths) {
                let entry = self.cached(raw)?;
                self.postboot.push(entry);
            }

            if let Some(mkext) = postboot.mkext {
                let entry = self.cached(&mkext.path)?;
                let extensions_dir = self.resolve(&mkext.extensions_dir)?;
                self.artifacts.push(ArtifactSpec {
                    kind: ArtifactKind::Mkext,
                    path: entry.source.clone(),
                    extensions_dir,
                    kernel: None,
                    archs: mkext.archs,
                });
                self.postboot.push(entry);
            }

            if let Some(kc) = postboot.kernelcache {
                let entry = self.cached(&kc.path)?;
                let extensions_dir = self.resolve(&kc.extensions_dir)?;
                let kernel = self.resolve(&kc.kernel_path)?;
                self.artifacts.push(ArtifactSpec {
                    kind: ArtifactKind::KernelCache,
                    path: entry.source.clone(),
                    extensions_dir,
                    kernel: Some(kernel),
                    archs: kc.archs,
                });
                self.postboot.push(entry);
            }
        }

        Ok(())
    }

    fn resolve(&self, raw: &str) -> BootcacheResult<PathBuf> {
        let rpath = validate_relative(raw).map_err(|reason| {
            BootcacheError::UnsupportedManifestShape {
                path: self.path.clone(),
                reason,
            }
        })?;
        Ok(self.volume.root.join(rpath))
    }

    fn cached(&self, raw: &str) -> BootcacheResult<CachedPath> {
        let rpath = validate_relative(raw).map_err(|reason| {
            BootcacheError::UnsupportedManifestShape {
                path: self.path.clone(),
                reason,
            }
        })?;
        Ok(CachedPath::new(&self.volume.root, &self.stamp_dir, rpath))
    }

    fn ensure_stamp_dir(&self, manifest_dev: u64) -> BootcacheResult<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&self.stamp_dir)
            .map_err(|e| {
                BootcacheError::io(
                    format!("creating stamp directory {}", self.stamp_dir.display()),
                    e,
                )
            })?;

        let meta = std::fs::metadata(&self.stamp_dir).map_err(|e| {
            BootcacheError::io(format!("inspecting {}", self.stamp_dir.display()), e)
        })?;
        if meta.dev() != manifest_dev {
            warn!(
                "Stamp directory {} crosses onto another device",
                self.stamp_dir.display()
            );
            return Err(BootcacheError::CrossVolume {
                path: self.stamp_dir.clone(),
            });
        }
        Ok(())
    }
}

fn check_trust(path: &Path, meta: &std::fs::Metadata, trust: ManifestTrust) -> BootcacheResult<()> {
    if meta.uid() != trust.owner_uid {
        return Err(BootcacheError::UntrustedManifest {
            path: path.to_path_buf(),
            reason: format!("owned by uid {}, expected {}", meta.uid(), trust.owner_uid),
        });
    }
    if meta.mode() & 0o022 != 0 {
        return Err(BootcacheError::UntrustedManifest {
            path: path.to_path_buf(),
            reason: format!("mode {:o} is writable by group or other", meta.mode() & 0o7777),
        });
    }
    Ok(())
}
