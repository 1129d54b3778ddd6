//! Timestamp-based staleness tracking
//!
//! A cached path is fresh iff its stamp exists and the stamp's mtime equals
//! the source's *change* time to the nanosecond. Using ctime means metadata
//! changes (owner, mode) invalidate the cache as well as content edits.
//!
//! Staleness is decided from timestamps alone; nothing here reads file
//! contents. The manifest trust check bounds who can arrange timestamps.

use crate::error::{BootcacheError, BootcacheResult};
use crate::manifest::{CacheManifest, CachedPath, CapturedTimes, PathCategory, SourceState};
use filetime::FileTime;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use tracing::{debug, info, warn};

/// Result of evaluating one cached path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub stale: bool,
    pub state: SourceState,
}

/// Aggregate dirty bits for a manifest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StalenessReport {
    pub any_stale: bool,
    pub postboot_stale: bool,
    pub booters_stale: bool,
    pub misc_stale: bool,
}

impl StalenessReport {
    fn mark(&mut self, category: PathCategory) {
        self.any_stale = true;
        match category {
            PathCategory::Misc => self.misc_stale = true,
            PathCategory::Booter => self.booters_stale = true,
            PathCategory::PostBoot => self.postboot_stale = true,
        }
    }
}

/// Source (atime, ctime) of a present file
pub fn source_times(meta: &fs::Metadata) -> CapturedTimes {
    CapturedTimes {
        atime: FileTime::from_last_access_time(meta),
        ctime: FileTime::from_unix_time(meta.ctime(), meta.ctime_nsec() as u32),
    }
}

/// Compare a cached path's source against its stamp
pub fn evaluate(entry: &CachedPath) -> io::Result<Evaluation> {
    let source = match fs::metadata(&entry.source) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("{} absent; nothing to cache", entry.rpath.display());
            return Ok(Evaluation {
                stale: false,
                state: SourceState::Missing,
            });
        }
        Err(e) => return Err(e),
    };
    let times = source_times(&source);
    let state = SourceState::Present(times);

    let stale = match fs::metadata(&entry.stamp) {
        Ok(stamp) => FileTime::from_last_modification_time(&stamp) != times.ctime,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => return Err(e),
    };

    debug!(
        "{}: {}",
        entry.rpath.display(),
        if stale { "stale" } else { "fresh" }
    );
    Ok(Evaluation { stale, state })
}

/// Evaluate every cached path, recording captured timestamps on the entries.
///
/// Misc failures are logged and skipped; booter and postboot failures abort.
pub fn evaluate_all(manifest: &mut CacheManifest) -> BootcacheResult<StalenessReport> {
    let mut report = StalenessReport::default();

    for (category, entry) in manifest.entries_mut() {
        match evaluate(entry) {
            Ok(evaluation) => {
                entry.state = evaluation.state;
                if evaluation.stale {
                    report.mark(category);
                }
            }
            Err(e) if !category.is_required() => {
                entry.state = SourceState::Unknown;
                warn!("Ignoring {} entry {}: {}", category, entry.source.display(), e);
            }
            Err(e) => {
                return Err(BootcacheError::Evaluate {
                    category: category.to_string(),
                    path: entry.source.clone(),
                    source: e,
                })
            }
        }
    }

    Ok(report)
}

/// Stamp one entry as fresh using its captured timestamps
pub fn commit(entry: &CachedPath) -> BootcacheResult<()> {
    let times = entry
        .captured()
        .ok_or_else(|| BootcacheError::NotEvaluated(entry.source.clone()))?;

    match fs::remove_file(&entry.stamp) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(BootcacheError::io(
                format!("removing stamp {}", entry.stamp.display()),
                e,
            ))
        }
    }

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(&entry.stamp)
        .map_err(|e| BootcacheError::io(format!("creating stamp {}", entry.stamp.display()), e))?;

    filetime::set_file_handle_times(&file, Some(times.atime), Some(times.ctime)).map_err(|e| {
        BootcacheError::io(format!("setting times on {}", entry.stamp.display()), e)
    })?;

    debug!("Stamped {}", entry.rpath.display());
    Ok(())
}

/// Commit every evaluated entry; returns how many stamps were written
pub fn commit_all(manifest: &CacheManifest) -> BootcacheResult<usize> {
    let mut written = 0;

    for (category, entry) in manifest.entries() {
        match entry.state {
            SourceState::Missing => continue,
            SourceState::Unknown if !category.is_required() => continue,
            _ => {}
        }
        match commit(entry) {
            Ok(()) => written += 1,
            Err(e) if !category.is_required() => {
                warn!("Could not stamp {} entry {}: {}", category, entry.rpath.display(), e);
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        "Committed {} stamps for {}",
        written,
        manifest.volume().identity
    );
    Ok(written)
}
