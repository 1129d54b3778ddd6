//! Volume update: rebuild what is out of date, then stamp everything fresh
//!
//! The sequence is load manifest, evaluate, lock, rebuild, re-evaluate,
//! commit stamps, release. The lock is released on every path once taken,
//! with a status reflecting whether the rebuild and commit succeeded.

use crate::builder::{BuildOutcome, BuildRequest, CacheBuilder};
use crate::container::ArchId;
use crate::error::BootcacheResult;
use crate::events::{self, EventLog};
use crate::lock::{ReleaseStatus, VolumeLock};
use crate::manifest::{CacheManifest, ManifestTrust};
use crate::staleness::{self, StalenessReport};
use crate::volume::Volume;
use serde_json::json;
use tracing::{debug, info, warn};

/// Knobs for one volume update
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Rebuild every artifact and restamp even when nothing looks stale
    pub force: bool,
    pub trust: ManifestTrust,
    /// Architectures for artifacts whose manifest entry names none
    pub default_archs: Vec<ArchId>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            force: false,
            trust: ManifestTrust::default(),
            default_archs: vec![ArchId::host()],
        }
    }
}

/// What an update did
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The volume declares no caches
    NoManifest,
    /// Every stamp and artifact was already current
    UpToDate,
    Updated {
        built: Vec<BuildOutcome>,
        stamps: usize,
        /// Stamps were not written because the volume is read-only
        read_only: bool,
    },
}

/// Services an update runs against
pub struct UpdateContext<'a> {
    pub builder: &'a CacheBuilder,
    pub lock: &'a VolumeLock,
    pub events: &'a EventLog,
}

/// Bring the caches of `volume` up to date
pub async fn update_volume(
    volume: &Volume,
    options: &UpdateOptions,
    ctx: &UpdateContext<'_>,
) -> BootcacheResult<UpdateOutcome> {
    let Some(mut manifest) = CacheManifest::load_with(volume, options.trust)? else {
        info!("{} has no boot caches to update", volume.identity);
        return Ok(UpdateOutcome::NoManifest);
    };

    let report = staleness::evaluate_all(&mut manifest)?;
    let pending = pending_builds(&manifest, options, ctx.builder)?;
    debug!(
        "{}: {:?}, {} artifacts need rebuilding",
        volume.identity,
        report,
        pending.len()
    );

    if !options.force && !report.any_stale && pending.is_empty() {
        info!("{} is up to date", volume.identity);
        return Ok(UpdateOutcome::UpToDate);
    }

    let token = ctx.lock.acquire(&volume.identity).await?;
    ctx.events
        .log(
            events::LOCK_ACQUIRED,
            &json!({
                "volume": volume.identity.uuid_string(),
                "label": volume.identity.label,
                "kind": format!("{:?}", token.kind()),
                "busy_retries": token.busy_retries(),
            }),
        )
        .await;

    let result = rebuild_and_commit(&mut manifest, &pending, &report, ctx).await;

    let status = ReleaseStatus::from_success(result.is_ok());
    token.release(status).await;
    ctx.events
        .log(
            events::LOCK_RELEASED,
            &json!({
                "volume": volume.identity.uuid_string(),
                "status": status.to_string(),
            }),
        )
        .await;

    result
}

/// Artifacts that must be (re)built before stamping
fn pending_builds(
    manifest: &CacheManifest,
    options: &UpdateOptions,
    builder: &CacheBuilder,
) -> BootcacheResult<Vec<BuildRequest>> {
    let mut pending = Vec::new();
    for spec in &manifest.artifacts {
        let request = BuildRequest::from_spec(spec, &options.default_archs);
        if options.force || !builder.is_current(&request)? {
            pending.push(request);
        }
    }
    Ok(pending)
}

async fn rebuild_and_commit(
    manifest: &mut CacheManifest,
    pending: &[BuildRequest],
    before: &StalenessReport,
    ctx: &UpdateContext<'_>,
) -> BootcacheResult<UpdateOutcome> {
    let mut built = Vec::with_capacity(pending.len());
    for request in pending {
        info!("Rebuilding {} ({})", request.output.display(), request.kind);
        ctx.events
            .log(
                events::REBUILD_STARTED,
                &json!({
                    "artifact": request.kind.to_string(),
                    "path": request.output.display().to_string(),
                }),
            )
            .await;

        match ctx.builder.build(request).await {
            Ok(outcome) => {
                ctx.events
                    .log(
                        events::REBUILD_FINISHED,
                        &json!({
                            "artifact": request.kind.to_string(),
                            "path": outcome.path.display().to_string(),
                            "size": outcome.size,
                            "built": outcome.built.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
                            "reused": outcome.reused.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
                        }),
                    )
                    .await;
                built.push(outcome);
            }
            Err(e) => {
                ctx.events
                    .log(
                        events::REBUILD_FAILED,
                        &json!({
                            "artifact": request.kind.to_string(),
                            "path": request.output.display().to_string(),
                            "error": e.to_string(),
                        }),
                    )
                    .await;
                return Err(e);
            }
        }
    }

    // timestamps must describe the post-build state
    let after = staleness::evaluate_all(manifest)?;
    debug!("Before rebuild {:?}, after {:?}", before, after);

    if manifest.volume().is_read_only() {
        warn!(
            "{} is read-only; not committing stamps",
            manifest.volume().identity
        );
        return Ok(UpdateOutcome::Updated {
            built,
            stamps: 0,
            read_only: true,
        });
    }

    let stamps = staleness::commit_all(manifest)?;
    ctx.events
        .log(
            events::STAMPS_COMMITTED,
            &json!({
                "volume": manifest.volume().identity.uuid_string(),
                "count": stamps,
            }),
        )
        .await;

    Ok(UpdateOutcome::Updated {
        built,
        stamps,
        read_only: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::test_support::{collaborators, FakeArchiver, FakeLinker};
    use crate::builder::BuildOptions;
    use crate::lock::NoCoordinator;
    use crate::manifest::test_support::write_manifest;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"
[postboot]
boot_config = "Library/Preferences/com.apple.Boot.plist"

[postboot.mkext]
path = "System/Library/Extensions.mkext"
extensions_dir = "System/Library/Extensions"
archs = ["ppc", "i386"]
"#;

    fn volume_with_manifest(content: &str) -> (TempDir, Volume) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write_manifest(root, content);
        std::fs::create_dir_all(root.join("Library/Preferences")).unwrap();
        std::fs::write(root.join("Library/Preferences/com.apple.Boot.plist"), "<plist/>").unwrap();
        std::fs::create_dir_all(root.join("System/Library/Extensions/Disk.kext")).unwrap();
        let volume = Volume::probe(root).unwrap();
        (dir, volume)
    }

    fn options() -> UpdateOptions {
        UpdateOptions {
            trust: ManifestTrust::current_user(),
            ..Default::default()
        }
    }

    async fn run(volume: &Volume, options: &UpdateOptions, archiver: Arc<FakeArchiver>) -> UpdateOutcome {
        let builder = CacheBuilder::new(
            collaborators(archiver, Arc::new(FakeLinker::default())),
            BuildOptions::default(),
        );
        let lock = VolumeLock::new(Arc::new(NoCoordinator), Default::default());
        let events = EventLog::disabled();
        let ctx = UpdateContext {
            builder: &builder,
            lock: &lock,
            events: &events,
        };
        update_volume(volume, options, &ctx).await.unwrap()
    }

    #[tokio::test]
    async fn missing_manifest_is_success() {
        let dir = TempDir::new().unwrap();
        let volume = Volume::probe(dir.path()).unwrap();
        let outcome = run(&volume, &options(), Arc::new(FakeArchiver::default())).await;
        assert_eq!(outcome, UpdateOutcome::NoManifest);
    }

    #[tokio::test]
    async fn builds_then_settles() {
        let (_dir, volume) = volume_with_manifest(MANIFEST);
        let archiver = Arc::new(FakeArchiver::default());

        let outcome = run(&volume, &options(), archiver.clone()).await;
        match outcome {
            UpdateOutcome::Updated { built, stamps, read_only } => {
                assert_eq!(built.len(), 1);
                assert_eq!(built[0].built.len(), 2);
                // boot config plus the artifact itself
                assert_eq!(stamps, 2);
                assert!(!read_only);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(volume.root.join("System/Library/Extensions.mkext").exists());

        let again = run(&volume, &options(), archiver.clone()).await;
        assert_eq!(again, UpdateOutcome::UpToDate);
        assert_eq!(archiver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn changed_source_restamps_without_rebuild() {
        let (_dir, volume) = volume_with_manifest(MANIFEST);
        let archiver = Arc::new(FakeArchiver::default());
        run(&volume, &options(), archiver.clone()).await;

        // a content change moves ctime; forge an old mtime on the stamp instead
        let stamp_dir = volume
            .root
            .join(crate::manifest::STAMP_ROOT)
            .join(volume.identity.uuid_string());
        let stamp = std::fs::read_dir(&stamp_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.to_string_lossy().contains("Boot.plist"))
            .unwrap();
        filetime::set_file_mtime(&stamp, filetime::FileTime::from_unix_time(1, 0)).unwrap();

        match run(&volume, &options(), archiver.clone()).await {
            UpdateOutcome::Updated { built, stamps, .. } => {
                assert!(built.is_empty());
                assert_eq!(stamps, 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(archiver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_rebuilds_current_artifacts() {
        let (_dir, volume) = volume_with_manifest(MANIFEST);
        let archiver = Arc::new(FakeArchiver::default());
        run(&volume, &options(), archiver.clone()).await;

        let forced = UpdateOptions {
            force: true,
            ..options()
        };
        match run(&volume, &forced, archiver.clone()).await {
            UpdateOutcome::Updated { built, .. } => {
                assert_eq!(built.len(), 1);
                // sources unchanged, so every slice is reused
                assert_eq!(built[0].reused.len(), 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(archiver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn build_failure_skips_stamps() {
        let (_dir, volume) = volume_with_manifest(MANIFEST);
        std::fs::remove_dir_all(volume.root.join("System/Library/Extensions")).unwrap();

        let builder = CacheBuilder::new(
            collaborators(Arc::new(FakeArchiver::default()), Arc::new(FakeLinker::default())),
            BuildOptions::default(),
        );
        let lock = VolumeLock::new(Arc::new(NoCoordinator), Default::default());
        let log_dir = TempDir::new().unwrap();
        let events = EventLog::at(log_dir.path().join("events.log"));
        let ctx = UpdateContext {
            builder: &builder,
            lock: &lock,
            events: &events,
        };

        assert!(update_volume(&volume, &options(), &ctx).await.is_err());
        let stamp_dir = volume
            .root
            .join(crate::manifest::STAMP_ROOT)
            .join(volume.identity.uuid_string());
        assert_eq!(std::fs::read_dir(&stamp_dir).unwrap().count(), 0);

        let log = std::fs::read_to_string(events.path()).unwrap();
        assert!(log.contains("rebuild.failed"));
        assert!(log.contains("lock.released"));
    }
}
