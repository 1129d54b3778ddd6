//! Linker and archiver backed by external programs
//!
//! The program receives `--arch <name>`, then `--kernel <path>` (linker) or
//! `--compress` (archiver, when requested), then the module paths. It writes
//! the finished slice to stdout.

use super::collaborators::{Archiver, Linker, ModuleRef};
use crate::config::schema::ToolCommand;
use crate::container::ArchId;
use crate::error::{BootcacheError, BootcacheResult};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Run a tool and collect stdout; `Err(reason)` on non-zero exit
async fn run_tool(tool: &ToolCommand, args: Vec<OsString>) -> BootcacheResult<Result<Vec<u8>, String>> {
    debug!("Executing: {} {:?} {:?}", tool.program.display(), tool.args, args);

    let output = Command::new(&tool.program)
        .args(&tool.args)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| BootcacheError::command_failed(tool.program.display().to_string(), e))?;

    if output.status.success() {
        Ok(Ok(output.stdout))
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(Err(format!("{} ({})", stderr.trim(), output.status)))
    }
}

fn arch_args(arch: ArchId) -> Vec<OsString> {
    vec!["--arch".into(), arch.to_string().into()]
}

/// Linker that shells out to a configured program
pub struct CommandLinker {
    tool: ToolCommand,
}

impl CommandLinker {
    pub fn new(tool: ToolCommand) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl Linker for CommandLinker {
    async fn link_kernel(
        &self,
        kernel: &Path,
        modules: &[ModuleRef],
        arch: ArchId,
    ) -> BootcacheResult<Vec<u8>> {
        let mut args = arch_args(arch);
        args.push("--kernel".into());
        args.push(kernel.as_os_str().to_owned());
        args.extend(modules.iter().map(|m| m.path.as_os_str().to_owned()));

        run_tool(&self.tool, args).await?.map_err(|reason| BootcacheError::Link {
            arch: arch.to_string(),
            reason,
        })
    }
}

/// Archiver that shells out to a configured program
pub struct CommandArchiver {
    tool: ToolCommand,
}

impl CommandArchiver {
    pub fn new(tool: ToolCommand) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl Archiver for CommandArchiver {
    async fn archive_modules(
        &self,
        modules: &[ModuleRef],
        arch: ArchId,
        compress: bool,
    ) -> BootcacheResult<Vec<u8>> {
        let mut args = arch_args(arch);
        if compress {
            args.push("--compress".into());
        }
        args.extend(modules.iter().map(|m| m.path.as_os_str().to_owned()));

        run_tool(&self.tool, args).await?.map_err(|reason| BootcacheError::Archive {
            arch: arch.to_string(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> ToolCommand {
        ToolCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string(), "tool".to_string()],
        }
    }

    #[tokio::test]
    async fn archiver_passes_arch_and_modules() {
        // $1=--arch $2=<arch> $3=--compress $4..=modules
        let archiver = CommandArchiver::new(sh(r#"printf '%s|%s|%s' "$2" "$3" "$4""#));
        let out = archiver
            .archive_modules(&[ModuleRef::new("/S/L/E/A.kext")], ArchId::from_name("ppc").unwrap(), true)
            .await
            .unwrap();
        assert_eq!(out, b"ppc|--compress|/S/L/E/A.kext");
    }

    #[tokio::test]
    async fn linker_passes_kernel() {
        let linker = CommandLinker::new(sh(r#"printf '%s %s' "$2" "$4""#));
        let out = linker
            .link_kernel(Path::new("/mach_kernel"), &[], ArchId::from_name("i386").unwrap())
            .await
            .unwrap();
        assert_eq!(out, b"i386 /mach_kernel");
    }

    #[tokio::test]
    async fn failing_tool_reports_stderr() {
        let linker = CommandLinker::new(sh("echo 'undefined symbol _foo' >&2; exit 3"));
        let err = linker
            .link_kernel(Path::new("/mach_kernel"), &[], ArchId::from_name("i386").unwrap())
            .await
            .unwrap_err();
        match err {
            BootcacheError::Link { arch, reason } => {
                assert_eq!(arch, "i386");
                assert!(reason.contains("undefined symbol _foo"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_command_failure() {
        let archiver = CommandArchiver::new(ToolCommand {
            program: PathBuf::from("/nonexistent/archiver"),
            args: vec![],
        });
        let err = archiver
            .archive_modules(&[], ArchId::from_name("ppc").unwrap(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, BootcacheError::CommandFailed { .. }));
    }
}
