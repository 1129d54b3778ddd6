//! Check command - report staleness without changing anything

use crate::builder::{artifact_is_current, BuildRequest};
use crate::cli::args::CheckArgs;
use crate::config::Config;
use crate::error::BootcacheResult;
use crate::manifest::{CacheManifest, PathCategory, SourceState};
use crate::staleness;
use crate::ui::{self, TaskSpinner, UiContext};
use std::time::Duration;

/// Execute the check command
pub async fn execute(args: CheckArgs, config: &Config) -> BootcacheResult<()> {
    let ctx = UiContext::detect();
    let volume = args.volume.probe()?;

    let Some(mut manifest) = CacheManifest::load_with(&volume, args.volume.trust())? else {
        ui::step_info(&ctx, &format!("{} declares no boot caches", volume.identity));
        return Ok(());
    };

    ui::section(&ctx, &volume.identity.to_string());
    ui::key_value(&ctx, "Stamps", &manifest.stamp_dir().display().to_string());

    for category in [PathCategory::Misc, PathCategory::Booter, PathCategory::PostBoot] {
        for (_, entry) in manifest.entries().filter(|(c, _)| *c == category) {
            let label = format!("{} {}", category, entry.rpath.display());
            match staleness::evaluate(entry) {
                Ok(eval) if eval.state == SourceState::Missing => {
                    ui::key_value_status(&ctx, &label, "missing", !category.is_required());
                }
                Ok(eval) => {
                    let value = if eval.stale { "stale" } else { "current" };
                    ui::key_value_status(&ctx, &label, value, !eval.stale);
                }
                Err(e) => ui::step_error(&ctx, &format!("{}: {}", label, e)),
            }
        }
    }

    let offset = Duration::from_secs(config.build.timestamp_offset_secs);
    let mut outdated = 0;
    for spec in &manifest.artifacts {
        let request = BuildRequest::from_spec(spec, &config.build.default_archs);
        let current = artifact_is_current(&request, offset)?;
        if !current {
            outdated += 1;
        }
        ui::key_value_status(
            &ctx,
            &format!("{} {}", spec.kind, spec.path.display()),
            if current { "current" } else { "out of date" },
            current,
        );
    }

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start("Evaluating stamps...");
    let report = match staleness::evaluate_all(&mut manifest) {
        Ok(report) => report,
        Err(e) => {
            spinner.stop_error("Stamp evaluation failed");
            return Err(e);
        }
    };
    if report.any_stale {
        spinner.stop_warn("Stamps are stale");
    } else {
        spinner.stop("Stamps are current");
    }

    if report.any_stale || outdated > 0 {
        ui::outro_warn(
            &ctx,
            &format!("Update needed. Run: bootcache update {}", volume.root.display()),
        );
    } else {
        ui::outro_success(&ctx, "Boot caches are current");
    }
    Ok(())
}
