//! Daemon command - run the lock coordinator on a Unix socket

use crate::cli::args::DaemonArgs;
use crate::config::Config;
use crate::coordinator::{server, Coordinator, CoordinatorSettings, ProcessLauncher};
use crate::error::{BootcacheError, BootcacheResult};
use crate::events::EventLog;
use crate::volume::Volume;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

/// Execute the daemon command
pub async fn execute(args: DaemonArgs, config: &Config, config_path: Option<PathBuf>) -> BootcacheResult<()> {
    let launcher = Arc::new(ProcessLauncher::current_exe(config_path)?);
    let mut coordinator = Coordinator::new(
        CoordinatorSettings::from(config),
        launcher,
        EventLog::new(config),
    );

    for root in config.daemon.watch.iter().chain(&args.watch) {
        match Volume::probe(root) {
            Ok(volume) => coordinator.watch(volume),
            Err(e) => warn!("Not watching {}: {}", root.display(), e),
        }
    }

    let socket = args.socket.unwrap_or_else(|| config.lock.socket_path.clone());
    let listener = server::bind(&socket)?;
    info!("Coordinator listening on {}", socket.display());

    let handle = coordinator.handle();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serving = tokio::spawn(server::serve(
        listener,
        handle.clone(),
        true,
        shutdown_rx.clone(),
    ));
    let running = tokio::spawn(coordinator.run(shutdown_rx));

    // check everything once at startup
    handle.rescan();

    let signal_err = |e| BootcacheError::io("installing signal handlers", e);
    let mut hangup = signal(SignalKind::hangup()).map_err(signal_err)?;
    let mut terminate = signal(SignalKind::terminate()).map_err(signal_err)?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP: rescanning watched volumes");
                handle.rescan();
            }
            _ = terminate.recv() => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down coordinator");
    let _ = shutdown_tx.send(true);
    let _ = serving.await;
    let _ = running.await;

    if let Err(e) = std::fs::remove_file(&socket) {
        warn!("Could not remove {}: {}", socket.display(), e);
    }
    Ok(())
}
