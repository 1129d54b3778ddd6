//! Cache artifact builder
//!
//! Builds the module archive and the linked kernel cache, one architecture
//! at a time, and installs the result atomically.
//!
//! # Commit protocol
//!
//! 1. Expected timestamp = newest source mtime (module directories and
//!    kernel) plus the configured offset
//! 2. Slices of an existing artifact whose mtime already equals that
//!    timestamp, and whose architecture is known to match, are reused
//!    verbatim; other slices are built
//! 3. Slices are assembled into one container, written to a temporary
//!    file beside the artifact and synced
//! 4. Module directories are re-stat'ed; if they moved, the temporary file is
//!    discarded and the build reports `Stale`
//! 5. The temporary file is renamed over the artifact and the artifact's
//!    mtime is set to the expected timestamp

pub mod collaborators;
pub mod command;
pub mod resolver;

pub use collaborators::{
    Archiver, BuildObserver, Linker, ModuleRef, ModuleResolver, SignatureResult, Silent,
    TrustPolicy,
};
pub use command::{CommandArchiver, CommandLinker};
pub use resolver::{DirectoryResolver, OwnershipTrustPolicy};

use crate::config::schema::{BuildConfig, ToolsConfig};
use crate::container::{self, ArchId, Container};
use crate::error::{BootcacheError, BootcacheResult};
use crate::manifest::{ArtifactKind, ArtifactSpec};
use filetime::FileTime;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// One artifact to build
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    pub kind: ArtifactKind,
    pub output: PathBuf,
    /// Kernel image (kernel caches only)
    pub kernel: Option<PathBuf>,
    pub module_dirs: Vec<PathBuf>,
    pub archs: Vec<ArchId>,
    /// Restrict modules to those required for these boot phases
    pub required_flags: Vec<String>,
}

impl BuildRequest {
    /// Request for a manifest-declared artifact
    pub fn from_spec(spec: &ArtifactSpec, default_archs: &[ArchId]) -> Self {
        let archs = if spec.archs.is_empty() {
            default_archs.to_vec()
        } else {
            spec.archs.clone()
        };
        Self {
            kind: spec.kind,
            output: spec.path.clone(),
            kernel: spec.kernel.clone(),
            module_dirs: vec![spec.extensions_dir.clone()],
            archs,
            required_flags: Vec::new(),
        }
    }

    fn source_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.module_dirs.iter().chain(self.kernel.iter())
    }
}

/// Build tuning
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    pub timestamp_offset: Duration,
    pub archive_size_limit: u64,
    pub archive_size_limits: HashMap<ArchId, u64>,
    pub compress: bool,
    pub align_log2: u32,
    pub idle_wait: Duration,
}

impl BuildOptions {
    /// Ceiling for one archived slice
    pub fn size_limit_for(&self, arch: ArchId) -> u64 {
        self.archive_size_limits
            .get(&arch)
            .copied()
            .unwrap_or(self.archive_size_limit)
    }
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            timestamp_offset: Duration::from_secs(1),
            archive_size_limit: 16 * 1024 * 1024,
            archive_size_limits: HashMap::new(),
            compress: true,
            align_log2: 0,
            idle_wait: Duration::ZERO,
        }
    }
}

impl TryFrom<&BuildConfig> for BuildOptions {
    type Error = BootcacheError;

    fn try_from(config: &BuildConfig) -> BootcacheResult<Self> {
        let mut limits = HashMap::new();
        for (name, limit) in &config.archive_size_limits {
            let arch: ArchId = name
                .parse()
                .map_err(|_| BootcacheError::UnknownArch(name.clone()))?;
            limits.insert(arch, *limit);
        }
        Ok(Self {
            timestamp_offset: Duration::from_secs(config.timestamp_offset_secs),
            archive_size_limit: config.archive_size_limit,
            archive_size_limits: limits,
            compress: config.compress,
            align_log2: config.align_log2,
            idle_wait: Duration::from_secs(config.idle_wait_secs),
        })
    }
}

/// What a successful build did
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    pub path: PathBuf,
    pub timestamp: FileTime,
    pub size: u64,
    pub built: Vec<ArchId>,
    pub reused: Vec<ArchId>,
}

/// Collaborators used by the builder
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn ModuleResolver>,
    pub trust: Arc<dyn TrustPolicy>,
    pub linker: Option<Arc<dyn Linker>>,
    pub archiver: Option<Arc<dyn Archiver>>,
}

impl Collaborators {
    /// Directory resolution, ownership trust and the configured external tools
    pub fn from_config(tools: &ToolsConfig, owner_uid: u32) -> Self {
        Self {
            resolver: Arc::new(DirectoryResolver),
            trust: Arc::new(OwnershipTrustPolicy::new(owner_uid)),
            linker: tools
                .linker
                .clone()
                .map(|tool| Arc::new(CommandLinker::new(tool)) as Arc<dyn Linker>),
            archiver: tools
                .archiver
                .clone()
                .map(|tool| Arc::new(CommandArchiver::new(tool)) as Arc<dyn Archiver>),
        }
    }
}

/// Builds cache artifacts
pub struct CacheBuilder {
    collaborators: Collaborators,
    options: BuildOptions,
    observer: Arc<dyn BuildObserver>,
}

impl CacheBuilder {
    pub fn new(collaborators: Collaborators, options: BuildOptions) -> Self {
        Self {
            collaborators,
            options,
            observer: Arc::new(Silent),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn BuildObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Whether the artifact on disk already matches its sources
    pub fn is_current(&self, request: &BuildRequest) -> BootcacheResult<bool> {
        artifact_is_current(request, self.options.timestamp_offset)
    }

    /// Build one artifact and install it
    pub async fn build(&self, request: &BuildRequest) -> BootcacheResult<BuildOutcome> {
        if request.archs.is_empty() {
            return Err(BootcacheError::NoArchs(request.output.clone()));
        }
        let kernel = match request.kind {
            ArtifactKind::KernelCache => Some(request.kernel.as_deref().ok_or_else(|| {
                BootcacheError::PathInvalid {
                    path: request.output.clone(),
                    reason: "kernel cache needs a kernel image".to_string(),
                }
            })?),
            ArtifactKind::Mkext => None,
        };

        if !self.options.idle_wait.is_zero() {
            info!("Waiting {:?} before building", self.options.idle_wait);
            tokio::time::sleep(self.options.idle_wait).await;
        }

        let dirs_mtime = latest_mtime(request.module_dirs.iter())?;
        let expected = expected_timestamp(request, self.options.timestamp_offset)?;
        debug!(
            "Building {} for {:?}; expected timestamp {}",
            request.output.display(),
            request.archs,
            expected
        );

        let existing = read_reusable(&request.output, expected).await?;
        let existing = match &existing {
            Some(bytes) => match Container::open(bytes) {
                Ok(container) => Some(container),
                Err(e) => {
                    warn!("Ignoring unreadable {}: {}", request.output.display(), e);
                    None
                }
            },
            None => None,
        };

        let mut modules: Option<Vec<ModuleRef>> = None;
        let mut slices = Vec::with_capacity(request.archs.len());
        let mut built = Vec::new();
        let mut reused = Vec::new();
        let total = request.archs.len();

        for (index, &arch) in request.archs.iter().enumerate() {
            self.observer.arch_started(arch, index, total);

            if let Some(bytes) = existing.as_ref().and_then(|c| reusable_slice(c, arch)) {
                debug!("Reusing {} slice of {}", arch, request.output.display());
                slices.push((arch, bytes.to_vec()));
                reused.push(arch);
                self.observer.arch_finished(arch, true);
                continue;
            }

            if modules.is_none() {
                modules = Some(self.included_modules(request)?);
            }
            let included = modules.as_deref().unwrap_or_default();

            let slice = match kernel {
                Some(kernel) => self.link(kernel, included, arch).await?,
                None => self.archive(included, arch).await?,
            };
            info!("Built {} slice ({} bytes)", arch, slice.len());
            slices.push((arch, slice));
            built.push(arch);
            self.observer.arch_finished(arch, false);
        }

        let bytes = container::write_aligned(&slices, self.options.align_log2)?;
        let size = bytes.len() as u64;
        self.install(request, &bytes, dirs_mtime, expected).await?;

        info!(
            "Installed {} ({} bytes, built {:?}, reused {:?})",
            request.output.display(),
            size,
            built,
            reused
        );
        Ok(BuildOutcome {
            path: request.output.clone(),
            timestamp: expected,
            size,
            built,
            reused,
        })
    }

    fn included_modules(&self, request: &BuildRequest) -> BootcacheResult<Vec<ModuleRef>> {
        let candidates = self
            .collaborators
            .resolver
            .resolve_modules(&request.module_dirs, &request.required_flags)?;

        let trust = &self.collaborators.trust;
        let modules: Vec<ModuleRef> = candidates
            .into_iter()
            .filter(|module| {
                if !trust.is_authentic(module) {
                    warn!("Skipping {}: not authentic", module.path.display());
                    return false;
                }
                match trust.signature(module) {
                    SignatureResult::Invalid => {
                        warn!("Skipping {}: invalid signature", module.path.display());
                        false
                    }
                    SignatureResult::Valid | SignatureResult::Unsigned => true,
                }
            })
            .collect();
        debug!("Including {} modules", modules.len());
        Ok(modules)
    }

    async fn link(&self, kernel: &Path, modules: &[ModuleRef], arch: ArchId) -> BootcacheResult<Vec<u8>> {
        let linker = self
            .collaborators
            .linker
            .as_ref()
            .ok_or_else(|| BootcacheError::ToolNotConfigured {
                tool: "linker".to_string(),
            })?;
        linker.link_kernel(kernel, modules, arch).await
    }

    async fn archive(&self, modules: &[ModuleRef], arch: ArchId) -> BootcacheResult<Vec<u8>> {
        let archiver = self
            .collaborators
            .archiver
            .as_ref()
            .ok_or_else(|| BootcacheError::ToolNotConfigured {
                tool: "archiver".to_string(),
            })?;
        let slice = archiver
            .archive_modules(modules, arch, self.options.compress)
            .await?;

        let limit = self.options.size_limit_for(arch);
        if slice.len() as u64 > limit {
            return Err(BootcacheError::ArtifactTooLarge {
                arch: arch.to_string(),
                size: slice.len() as u64,
                limit,
            });
        }
        Ok(slice)
    }

    /// Temp write, staleness guard, rename, stamp.
    ///
    /// The temp file is removed on every early return.
    async fn install(
        &self,
        request: &BuildRequest,
        bytes: &[u8],
        dirs_mtime: FileTime,
        expected: FileTime,
    ) -> BootcacheResult<()> {
        let mut temp = temp_file(&request.output)?;
        let temp_err = |what: &str, e| {
            BootcacheError::io(format!("{} temp file for {}", what, request.output.display()), e)
        };
        temp.write_all(bytes).map_err(|e| temp_err("writing", e))?;
        temp.as_file().sync_all().map_err(|e| temp_err("syncing", e))?;

        let guard = latest_mtime(request.module_dirs.iter());
        if !matches!(guard, Ok(now) if now == dirs_mtime) {
            warn!(
                "Module sources changed during build; not installing {}",
                request.output.display()
            );
            return Err(BootcacheError::Stale {
                path: request.output.clone(),
            });
        }

        temp.persist(&request.output).map_err(|e| {
            BootcacheError::io(format!("renaming into {}", request.output.display()), e.error)
        })?;

        filetime::set_file_mtime(&request.output, expected).map_err(|e| {
            BootcacheError::io(format!("stamping {}", request.output.display()), e)
        })?;
        Ok(())
    }
}

/// Whether `request.output` exists with exactly the expected timestamp
pub fn artifact_is_current(request: &BuildRequest, offset: Duration) -> BootcacheResult<bool> {
    let meta = match std::fs::metadata(&request.output) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(BootcacheError::io(
                format!("inspecting {}", request.output.display()),
                e,
            ))
        }
    };
    let expected = match expected_timestamp(request, offset) {
        Ok(expected) => expected,
        // sources that cannot be inspected cannot be current
        Err(BootcacheError::PathNotFound(_)) => return Ok(false),
        Err(e) => return Err(e),
    };
    Ok(FileTime::from_last_modification_time(&meta) == expected)
}

/// Newest source mtime plus `offset`
pub fn expected_timestamp(request: &BuildRequest, offset: Duration) -> BootcacheResult<FileTime> {
    let newest = latest_mtime(request.source_paths())?;
    Ok(add_offset(newest, offset))
}

/// Suffix an artifact path with a short digest of a variant string
pub fn variant_path(base: &Path, variant: &str) -> PathBuf {
    let digest = Sha256::digest(variant.as_bytes());
    let suffix = hex::encode_upper(&digest[..4]);
    let mut name = base.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    base.with_file_name(name)
}

fn latest_mtime<'a>(paths: impl Iterator<Item = &'a PathBuf>) -> BootcacheResult<FileTime> {
    let mut newest = FileTime::zero();
    for path in paths {
        let meta = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BootcacheError::PathNotFound(path.clone())
            } else {
                BootcacheError::io(format!("inspecting {}", path.display()), e)
            }
        })?;
        newest = newest.max(FileTime::from_last_modification_time(&meta));
    }
    Ok(newest)
}

fn add_offset(time: FileTime, offset: Duration) -> FileTime {
    let nanos = u64::from(time.nanoseconds()) + u64::from(offset.subsec_nanos());
    let secs = time.unix_seconds() + offset.as_secs() as i64 + (nanos / 1_000_000_000) as i64;
    FileTime::from_unix_time(secs, (nanos % 1_000_000_000) as u32)
}

/// Existing artifact bytes, if its mtime shows it was built from the current sources
async fn read_reusable(path: &Path, expected: FileTime) -> BootcacheResult<Option<Vec<u8>>> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BootcacheError::io(format!("inspecting {}", path.display()), e)),
    };
    if FileTime::from_last_modification_time(&meta) != expected {
        debug!("{} predates current sources; rebuilding all slices", path.display());
        return Ok(None);
    }
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| BootcacheError::io(format!("reading {}", path.display()), e))?;
    Ok(Some(bytes))
}

/// The slice of `container` built for exactly `arch`.
///
/// A slice whose architecture cannot be read from its bytes is never reused.
fn reusable_slice<'a>(container: &Container<'a>, arch: ArchId) -> Option<&'a [u8]> {
    container
        .find_best_match(&arch)
        .filter(|s| s.arch == Some(arch))
        .map(|s| container.slice_bytes(&s))
}

fn temp_file(output: &Path) -> BootcacheResult<NamedTempFile> {
    let name = output.file_name().ok_or_else(|| BootcacheError::PathInvalid {
        path: output.to_path_buf(),
        reason: "artifact path has no file name".to_string(),
    })?;
    let dir = match output.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    tempfile::Builder::new()
        .prefix(&format!(".{}.tmp-", name.to_string_lossy()))
        .tempfile_in(dir)
        .map_err(|e| BootcacheError::io(format!("creating temp file in {}", dir.display()), e))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub struct TrustAll;

    impl TrustPolicy for TrustAll {
        fn is_authentic(&self, _: &ModuleRef) -> bool {
            true
        }

        fn signature(&self, _: &ModuleRef) -> SignatureResult {
            SignatureResult::Unsigned
        }
    }

    /// Archiver producing `<arch>:<module names>` and counting calls
    #[derive(Default)]
    pub struct FakeArchiver {
        pub calls: AtomicUsize,
        pub pad_to: usize,
        /// Run once after the first call, to simulate concurrent edits
        pub on_call: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    #[async_trait]
    impl Archiver for FakeArchiver {
        async fn archive_modules(
            &self,
            modules: &[ModuleRef],
            arch: ArchId,
            _compress: bool,
        ) -> BootcacheResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(hook) = self.on_call.lock().unwrap().take() {
                hook();
            }
            let names: Vec<String> = modules.iter().map(|m| m.name()).collect();
            let mut out = format!("{}:{}", arch, names.join(",")).into_bytes();
            if out.len() < self.pad_to {
                out.resize(self.pad_to, 0);
            }
            Ok(out)
        }
    }

    /// Linker producing `<arch>+<kernel>`
    #[derive(Default)]
    pub struct FakeLinker {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl Linker for FakeLinker {
        async fn link_kernel(
            &self,
            kernel: &Path,
            _modules: &[ModuleRef],
            arch: ArchId,
        ) -> BootcacheResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}+{}", arch, kernel.display()).into_bytes())
        }
    }

    pub fn collaborators(
        archiver: Arc<FakeArchiver>,
        linker: Arc<FakeLinker>,
    ) -> Collaborators {
        Collaborators {
            resolver: Arc::new(DirectoryResolver),
            trust: Arc::new(TrustAll),
            linker: Some(linker as Arc<dyn Linker>),
            archiver: Some(archiver as Arc<dyn Archiver>),
        }
    }
}
