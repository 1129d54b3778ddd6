//! Directory-based module resolution and ownership trust

use super::collaborators::{ModuleRef, ModuleResolver, SignatureResult, TrustPolicy};
use crate::error::{BootcacheError, BootcacheResult};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Bundle extension picked up by [`DirectoryResolver`]
const BUNDLE_EXTENSION: &str = "kext";

/// File inside a bundle naming the boot phase that requires it
const REQUIRED_MARKER: &str = "Contents/OSBundleRequired";

/// Lists `*.kext` bundles directly inside each directory.
///
/// With required flags, only bundles whose `Contents/OSBundleRequired`
/// names one of the flags are kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryResolver;

impl DirectoryResolver {
    fn bundles_in(dir: &Path) -> BootcacheResult<Vec<PathBuf>> {
        let entries = fs::read_dir(dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BootcacheError::PathNotFound(dir.to_path_buf())
            } else {
                BootcacheError::io(format!("listing {}", dir.display()), e)
            }
        })?;

        let mut bundles = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BootcacheError::io(format!("listing {}", dir.display()), e))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == BUNDLE_EXTENSION) && path.is_dir() {
                bundles.push(path);
            }
        }
        bundles.sort();
        Ok(bundles)
    }

    fn required_flag(bundle: &Path) -> Option<String> {
        fs::read_to_string(bundle.join(REQUIRED_MARKER))
            .ok()
            .map(|s| s.trim().to_string())
    }
}

impl ModuleResolver for DirectoryResolver {
    fn resolve_modules(&self, dirs: &[PathBuf], flags: &[String]) -> BootcacheResult<Vec<ModuleRef>> {
        let mut modules = Vec::new();
        for dir in dirs {
            for bundle in Self::bundles_in(dir)? {
                if !flags.is_empty() {
                    match Self::required_flag(&bundle) {
                        Some(flag) if flags.contains(&flag) => {}
                        _ => {
                            debug!("Skipping {}: not required for {:?}", bundle.display(), flags);
                            continue;
                        }
                    }
                }
                modules.push(ModuleRef::new(bundle));
            }
        }
        debug!("Resolved {} modules from {} directories", modules.len(), dirs.len());
        Ok(modules)
    }
}

/// Authentic iff owned by the trusted owner and not group/other-writable.
///
/// Signatures are not checked here; every module reports `Unsigned`.
#[derive(Debug, Clone, Copy)]
pub struct OwnershipTrustPolicy {
    owner_uid: u32,
}

impl OwnershipTrustPolicy {
    pub fn new(owner_uid: u32) -> Self {
        Self { owner_uid }
    }
}

impl Default for OwnershipTrustPolicy {
    fn default() -> Self {
        Self::new(0)
    }
}

impl TrustPolicy for OwnershipTrustPolicy {
    fn is_authentic(&self, module: &ModuleRef) -> bool {
        match fs::symlink_metadata(&module.path) {
            Ok(meta) => meta.uid() == self.owner_uid && meta.mode() & 0o022 == 0,
            Err(_) => false,
        }
    }

    fn signature(&self, _module: &ModuleRef) -> SignatureResult {
        SignatureResult::Unsigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn bundle(dir: &Path, name: &str, required: Option<&str>) -> PathBuf {
        let path = dir.join(name);
        fs::create_dir_all(path.join("Contents")).unwrap();
        if let Some(flag) = required {
            fs::write(path.join(REQUIRED_MARKER), format!("{}\n", flag)).unwrap();
        }
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn lists_bundles_sorted() {
        let dir = TempDir::new().unwrap();
        bundle(dir.path(), "Zeta.kext", None);
        bundle(dir.path(), "Alpha.kext", None);
        fs::write(dir.path().join("README"), "not a bundle").unwrap();
        fs::create_dir(dir.path().join("Plugins")).unwrap();

        let modules = DirectoryResolver
            .resolve_modules(&[dir.path().to_path_buf()], &[])
            .unwrap();
        let names: Vec<_> = modules.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["Alpha.kext", "Zeta.kext"]);
    }

    #[test]
    fn required_flags_filter() {
        let dir = TempDir::new().unwrap();
        bundle(dir.path(), "Disk.kext", Some("Local-Root"));
        bundle(dir.path(), "Audio.kext", None);
        bundle(dir.path(), "Net.kext", Some("Network-Root"));

        let modules = DirectoryResolver
            .resolve_modules(&[dir.path().to_path_buf()], &["Local-Root".to_string()])
            .unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].name(), "Disk.kext");
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = DirectoryResolver
            .resolve_modules(&[dir.path().join("Extensions")], &[])
            .unwrap_err();
        assert!(matches!(err, BootcacheError::PathNotFound(_)));
    }

    #[test]
    fn ownership_policy() {
        let dir = TempDir::new().unwrap();
        let path = bundle(dir.path(), "Mine.kext", None);
        let module = ModuleRef::new(&path);
        let policy = OwnershipTrustPolicy::new(crate::privilege::effective_uid());

        assert!(policy.is_authentic(&module));
        assert_eq!(policy.signature(&module), SignatureResult::Unsigned);

        fs::set_permissions(&path, fs::Permissions::from_mode(0o775)).unwrap();
        assert!(!policy.is_authentic(&module));
        assert!(!policy.is_authentic(&ModuleRef::new(dir.path().join("Gone.kext"))));
    }
}
