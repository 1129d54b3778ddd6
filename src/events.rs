//! Event log for rebuilds, locks and stamp commits
//!
//! Appends JSON lines to `events.log` under the state directory (or
//! `general.event_log_path`). Writing is best effort: failures are logged
//! and never reach the caller.

use crate::config::{schema::Config, ConfigManager};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

pub const LOCK_ACQUIRED: &str = "lock.acquired";
pub const LOCK_RELEASED: &str = "lock.released";
pub const REBUILD_STARTED: &str = "rebuild.started";
pub const REBUILD_FINISHED: &str = "rebuild.finished";
pub const REBUILD_FAILED: &str = "rebuild.failed";
pub const STAMPS_COMMITTED: &str = "stamps.committed";
pub const REBUILD_LAUNCHED: &str = "coordinator.launch";

/// File-based event logger that appends JSON lines
#[derive(Debug, Clone)]
pub struct EventLog {
    enabled: bool,
    path: PathBuf,
}

impl EventLog {
    /// Create an event logger from config
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.general.event_log,
            path: config
                .general
                .event_log_path
                .clone()
                .unwrap_or_else(ConfigManager::event_log_path),
        }
    }

    /// Logger writing to an explicit file
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            path: path.into(),
        }
    }

    /// Logger that drops everything
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an event as a JSON line
    pub async fn log(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write event log {}: {}", self.path.display(), e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_json_line() {
        let dir = TempDir::new().unwrap();
        let events = EventLog::at(dir.path().join("events.log"));

        events
            .log(REBUILD_FINISHED, &serde_json::json!({"artifact": "mkext"}))
            .await;

        let content = tokio::fs::read_to_string(events.path()).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();

        assert_eq!(parsed["event"], "rebuild.finished");
        assert_eq!(parsed["data"]["artifact"], "mkext");
        assert!(parsed["timestamp"].is_string());
    }

    #[tokio::test]
    async fn appends_multiple_lines() {
        let dir = TempDir::new().unwrap();
        let events = EventLog::at(dir.path().join("nested").join("events.log"));

        events.log(LOCK_ACQUIRED, &serde_json::json!({})).await;
        events.log(LOCK_RELEASED, &serde_json::json!({})).await;

        let content = tokio::fs::read_to_string(events.path()).await.unwrap();
        assert_eq!(content.trim().lines().count(), 2);
    }

    #[tokio::test]
    async fn unwritable_path_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let events = EventLog::at(blocker.join("events.log"));

        events.log(STAMPS_COMMITTED, &serde_json::json!({})).await;
    }

    #[test]
    fn config_path_override() {
        let mut config = Config::default();
        config.general.event_log_path = Some(PathBuf::from("/tmp/bc-events.log"));
        config.general.event_log = false;
        let events = EventLog::new(&config);
        assert_eq!(events.path(), Path::new("/tmp/bc-events.log"));
        assert!(!events.enabled);
    }
}
