//! Starting rebuilds on behalf of the coordinator

use crate::error::{BootcacheError, BootcacheResult};
use crate::volume::Volume;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Starts a volume update without waiting for it
#[async_trait]
pub trait RebuildLauncher: Send + Sync {
    async fn launch(&self, volume: &Volume) -> BootcacheResult<()>;
}

/// Runs `<program> [-c <config>] update <root> --uuid <uuid> --label <label>`
/// as a detached child and reaps it in the background.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    config: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, config: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config,
        }
    }

    /// Launch updates with the running executable
    pub fn current_exe(config: Option<PathBuf>) -> BootcacheResult<Self> {
        let program = std::env::current_exe()
            .map_err(|e| BootcacheError::io("locating the bootcache executable", e))?;
        Ok(Self::new(program, config))
    }

    fn command(&self, volume: &Volume) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(config) = &self.config {
            cmd.arg("--config").arg(config);
        }
        cmd.arg("update")
            .arg(&volume.root)
            .arg("--uuid")
            .arg(volume.identity.uuid.to_string())
            .arg("--label")
            .arg(&volume.identity.label);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

#[async_trait]
impl RebuildLauncher for ProcessLauncher {
    async fn launch(&self, volume: &Volume) -> BootcacheResult<()> {
        let mut child = self
            .command(volume)
            .spawn()
            .map_err(|e| BootcacheError::command_failed(self.program.display().to_string(), e))?;

        info!(
            "Launched update of {} (pid {})",
            volume.identity,
            child.id().unwrap_or_default()
        );

        let label = volume.identity.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!("Update of {} finished", label),
                Ok(status) => warn!("Update of {} exited with {}", label, status),
                Err(e) => warn!("Could not reap update of {}: {}", label, e),
            }
        });
        Ok(())
    }
}
