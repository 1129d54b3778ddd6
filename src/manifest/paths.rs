//! Cached path entries and the stamp-name mapping
//!
//! Each cached source file has a stamp file in the per-volume stamp
//! directory. The stamp name is the source's relative path with `/` turned
//! into `:`; `%` and `:` are percent-escaped first so the mapping is
//! collision-free and reversible.

use filetime::FileTime;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Category a cached path belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathCategory {
    /// Read before the booter; failures are logged and ignored
    Misc,
    /// Platform boot loaders
    Booter,
    /// Needed after the booter hands off
    PostBoot,
}

impl PathCategory {
    /// Whether evaluation failures in this category are fatal
    pub fn is_required(&self) -> bool {
        !matches!(self, Self::Misc)
    }
}

impl fmt::Display for PathCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Misc => "misc",
            Self::Booter => "booter",
            Self::PostBoot => "postboot",
        };
        write!(f, "{}", name)
    }
}

/// Source timestamps captured during evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedTimes {
    pub atime: FileTime,
    pub ctime: FileTime,
}

/// What the last evaluation saw at the source path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceState {
    /// Not evaluated yet, or evaluation failed
    #[default]
    Unknown,
    /// Source absent; nothing to stamp
    Missing,
    /// Source present with these timestamps
    Present(CapturedTimes),
}

/// One cached source file and its stamp
#[derive(Debug, Clone)]
pub struct CachedPath {
    /// Path relative to the volume root
    pub rpath: PathBuf,
    /// Absolute source path
    pub source: PathBuf,
    /// Absolute stamp path
    pub stamp: PathBuf,
    /// Set by evaluation, consumed by commit
    pub state: SourceState,
}

impl CachedPath {
    pub(crate) fn new(root: &Path, stamp_dir: &Path, rpath: PathBuf) -> Self {
        let stamp = stamp_dir.join(escape_stamp_name(&rpath.to_string_lossy()));
        Self {
            source: root.join(&rpath),
            stamp,
            rpath,
            state: SourceState::Unknown,
        }
    }

    /// Timestamps captured by the last evaluation
    pub fn captured(&self) -> Option<CapturedTimes> {
        match self.state {
            SourceState::Present(times) => Some(times),
            _ => None,
        }
    }
}

/// Map a relative source path onto a stamp file name
pub fn escape_stamp_name(rpath: &str) -> String {
    let mut out = String::with_capacity(rpath.len());
    for c in rpath.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '/' => out.push(':'),
            c => out.push(c),
        }
    }
    out
}

/// Invert [`escape_stamp_name`]; `None` for names it cannot have produced
pub fn unescape_stamp_name(name: &str) -> Option<String> {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        match c {
            ':' => out.push('/'),
            '%' => {
                let code: String = chars.by_ref().take(2).collect();
                match code.as_str() {
                    "25" => out.push('%'),
                    "3A" => out.push(':'),
                    _ => return None,
                }
            }
            c => out.push(c),
        }
    }
    Some(out)
}

/// Check that a declared path stays inside the volume
pub(crate) fn validate_relative(raw: &str) -> Result<PathBuf, String> {
    if raw.is_empty() {
        return Err("empty path".to_string());
    }
    let path = Path::new(raw);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err(format!("'{}' escapes the volume", raw)),
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("'{}' is not relative to the volume root", raw))
            }
        }
    }
    Ok(path.to_path_buf())
}
