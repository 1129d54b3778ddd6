//! Build command - build one artifact outside any manifest

use crate::builder::{variant_path, BuildOptions, BuildRequest, CacheBuilder, Collaborators};
use crate::cli::args::BuildArgs;
use crate::config::Config;
use crate::container::ArchId;
use crate::error::{BootcacheError, BootcacheResult};
use crate::ui::{self, ArchProgress, UiContext};
use std::sync::Arc;

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config) -> BootcacheResult<()> {
    let ctx = UiContext::detect();

    let archs = if args.archs.is_empty() {
        config.build.default_archs.clone()
    } else {
        args.archs
            .iter()
            .map(|name| {
                name.parse::<ArchId>()
                    .map_err(|_| BootcacheError::UnknownArch(name.clone()))
            })
            .collect::<BootcacheResult<Vec<_>>>()?
    };

    let output = match &args.variant {
        Some(variant) => variant_path(&args.output, variant),
        None => args.output.clone(),
    };
    let request = BuildRequest {
        kind: args.kind.into(),
        output,
        kernel: args.kernel,
        module_dirs: args.modules,
        archs,
        required_flags: args.required,
    };

    let label = request
        .output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| request.kind.to_string());
    let progress = Arc::new(ArchProgress::new(&ctx, &label));
    let builder = CacheBuilder::new(
        Collaborators::from_config(&config.tools, args.owner.unwrap_or(0)),
        BuildOptions::try_from(&config.build)?,
    )
    .with_observer(progress.clone());

    let result = builder.build(&request).await;
    progress.finish();
    let outcome = result?;

    ui::outro_success(
        &ctx,
        &format!(
            "Wrote {} ({} bytes; built {}, reused {})",
            outcome.path.display(),
            outcome.size,
            join(&outcome.built),
            join(&outcome.reused)
        ),
    );
    Ok(())
}

fn join(archs: &[ArchId]) -> String {
    if archs.is_empty() {
        return "none".to_string();
    }
    archs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
