//! Update command - rebuild and restamp one volume

use crate::builder::{BuildOptions, CacheBuilder, Collaborators};
use crate::cli::args::UpdateArgs;
use crate::config::Config;
use crate::error::BootcacheResult;
use crate::events::EventLog;
use crate::lock::{LockPolicy, SocketLocator, VolumeLock};
use crate::ui::{self, ArchProgress, UiContext};
use crate::update::{update_volume, UpdateContext, UpdateOptions, UpdateOutcome};
use std::sync::Arc;

/// Execute the update command
pub async fn execute(args: UpdateArgs, config: &Config) -> BootcacheResult<()> {
    let ctx = UiContext::detect();
    let volume = args.volume.probe()?;
    let trust = args.volume.trust();

    let progress = Arc::new(ArchProgress::new(&ctx, &volume.identity.label));
    let builder = CacheBuilder::new(
        Collaborators::from_config(&config.tools, trust.owner_uid),
        BuildOptions::try_from(&config.build)?,
    )
    .with_observer(progress.clone());
    let lock = VolumeLock::new(
        Arc::new(SocketLocator::new(&config.lock.socket_path)),
        LockPolicy::from(&config.lock),
    );
    let events = EventLog::new(config);

    let options = UpdateOptions {
        force: args.force,
        trust,
        default_archs: config.build.default_archs.clone(),
    };
    let update_ctx = UpdateContext {
        builder: &builder,
        lock: &lock,
        events: &events,
    };

    let outcome = update_volume(&volume, &options, &update_ctx).await;
    progress.finish();

    match outcome? {
        UpdateOutcome::NoManifest => {
            ui::step_info(&ctx, &format!("{} declares no boot caches", volume.identity));
        }
        UpdateOutcome::UpToDate => {
            ui::outro_success(&ctx, &format!("{} is up to date", volume.identity));
        }
        UpdateOutcome::Updated {
            built,
            stamps,
            read_only,
        } => {
            for outcome in &built {
                ui::step_ok_detail(
                    &ctx,
                    &outcome.path.display().to_string(),
                    &format!(
                        "{} bytes, {} built, {} reused",
                        outcome.size,
                        outcome.built.len(),
                        outcome.reused.len()
                    ),
                );
            }
            if read_only {
                ui::outro_warn(&ctx, "Volume is read-only; stamps were not written");
            } else {
                ui::outro_success(
                    &ctx,
                    &format!("Updated {} ({} stamps)", volume.identity, stamps),
                );
            }
        }
    }
    Ok(())
}
