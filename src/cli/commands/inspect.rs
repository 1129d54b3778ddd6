//! Inspect command - list the slices of a container

use crate::cli::args::InspectArgs;
use crate::container::{ArchId, Container, ContainerKind};
use crate::error::{BootcacheError, BootcacheResult};
use crate::ui::{self, UiContext};

/// Execute the inspect command
pub async fn execute(args: InspectArgs) -> BootcacheResult<()> {
    let ctx = UiContext::detect();
    let data = tokio::fs::read(&args.file)
        .await
        .map_err(|e| BootcacheError::io(format!("reading {}", args.file.display()), e))?;
    let container = Container::open(&data)?;

    let kind = match container.kind() {
        ContainerKind::Tagged => "multi-architecture",
        ContainerKind::Untagged => "single slice",
    };
    ui::section(&ctx, &format!("{} ({}, {} bytes)", args.file.display(), kind, data.len()));

    for (index, slice) in container.slices().enumerate() {
        let arch = slice
            .arch
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        ui::key_value(
            &ctx,
            &format!("[{}] {}", index, arch),
            &format!(
                "offset {} size {} align 2^{}",
                slice.offset, slice.size, slice.align
            ),
        );
    }

    if let Some(name) = args.arch {
        let want: ArchId = name
            .parse()
            .map_err(|_| BootcacheError::UnknownArch(name.clone()))?;
        match container.find_best_match(&want) {
            Some(slice) => {
                let arch = slice.arch.map(|a| a.to_string()).unwrap_or_default();
                ui::step_ok_detail(
                    &ctx,
                    &format!("Best match for {}: {}", want, arch),
                    &format!("offset {}", slice.offset),
                );
            }
            None => {
                return Err(BootcacheError::PathInvalid {
                    path: args.file,
                    reason: format!("no slice runs on {}", want),
                })
            }
        }
    }
    Ok(())
}
