//! Lock coordinator
//!
//! One event loop owns every watched volume's state: who holds its lock,
//! how many rebuilds in a row have failed, and whether a check is pending.
//! Clients talk to it through [`InProcessTransport`] or the Unix socket
//! served by [`server`].
//!
//! # Events
//!
//! | Event | Effect |
//! |-------|--------|
//! | `Lock` | `Granted`, `Busy`, `NotRegistered` or `Refused` |
//! | `Unlock` | Release if the sender holds the lock; count failures |
//! | `ClientGone` | Release every lock the client still holds, as a failure |
//! | `VolumeAppeared` | Start watching; check after the settle delay |
//! | `VolumeDisappeared` | Stop watching |
//! | `Rescan` | Check every watched volume now |
//! | `Demand` | Check one volume now |
//!
//! A check launches a rebuild when an artifact is out of date or a stamp
//! is stale, the volume is unlocked, and its failure count is below the
//! limit.

pub mod launcher;
pub mod server;

pub use launcher::{ProcessLauncher, RebuildLauncher};

use crate::builder::{artifact_is_current, BuildRequest};
use crate::config::schema::Config;
use crate::container::ArchId;
use crate::error::BootcacheResult;
use crate::events::{self, EventLog};
use crate::lock::{CoordinatorLocator, CoordinatorTransport, LockReply, ReleaseStatus, TransportError};
use crate::manifest::{CacheManifest, ManifestTrust};
use crate::staleness;
use crate::volume::{Volume, VolumeIdentity};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Identifies one client connection
pub type ClientId = u64;

/// Everything the coordinator reacts to
#[derive(Debug)]
pub enum Event {
    Lock {
        client: ClientId,
        privileged: bool,
        volume: Uuid,
        reply: oneshot::Sender<LockReply>,
    },
    Unlock {
        client: ClientId,
        volume: Uuid,
        status: ReleaseStatus,
        reply: oneshot::Sender<bool>,
    },
    ClientGone {
        client: ClientId,
    },
    VolumeAppeared {
        root: PathBuf,
    },
    VolumeDisappeared {
        volume: Uuid,
    },
    Rescan,
    Demand {
        volume: Uuid,
    },
    /// Settle delay after a change elapsed
    Settled {
        volume: Uuid,
    },
}

/// Coordinator tuning
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub failure_limit: u32,
    pub settle: Duration,
    pub trust: ManifestTrust,
    pub timestamp_offset: Duration,
    pub default_archs: Vec<ArchId>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for CoordinatorSettings {
    fn from(config: &Config) -> Self {
        Self {
            failure_limit: config.daemon.failure_limit,
            settle: Duration::from_secs(config.daemon.settle_secs),
            trust: ManifestTrust::default(),
            timestamp_offset: Duration::from_secs(config.build.timestamp_offset_secs),
            default_archs: config.build.default_archs.clone(),
        }
    }
}

#[derive(Debug)]
struct Watched {
    volume: Volume,
    holder: Option<ClientId>,
    failures: u32,
    /// A settle timer is running
    check_scheduled: bool,
    /// A check was wanted while the lock was held
    check_deferred: bool,
}

impl Watched {
    fn new(volume: Volume) -> Self {
        Self {
            volume,
            holder: None,
            failures: 0,
            check_scheduled: false,
            check_deferred: false,
        }
    }
}

/// Sends events to a running coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Event>,
    next_client: Arc<AtomicU64>,
}

impl CoordinatorHandle {
    /// Allocate a client id for a new connection
    pub fn next_client(&self) -> ClientId {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue an event; `false` once the coordinator has stopped
    pub fn send(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Open an in-process client connection
    pub fn connect(&self, privileged: bool) -> InProcessTransport {
        InProcessTransport {
            client: self.next_client(),
            privileged,
            tx: self.tx.clone(),
        }
    }

    pub fn rescan(&self) -> bool {
        self.send(Event::Rescan)
    }

    pub fn demand(&self, volume: Uuid) -> bool {
        self.send(Event::Demand { volume })
    }

    pub fn volume_appeared(&self, root: impl Into<PathBuf>) -> bool {
        self.send(Event::VolumeAppeared { root: root.into() })
    }

    pub fn volume_disappeared(&self, volume: Uuid) -> bool {
        self.send(Event::VolumeDisappeared { volume })
    }
}

/// The coordinator's state and event loop
pub struct Coordinator {
    volumes: HashMap<Uuid, Watched>,
    settings: CoordinatorSettings,
    launcher: Arc<dyn RebuildLauncher>,
    events: EventLog,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    handle: CoordinatorHandle,
}

impl Coordinator {
    pub fn new(
        settings: CoordinatorSettings,
        launcher: Arc<dyn RebuildLauncher>,
        events: EventLog,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = CoordinatorHandle {
            tx: tx.clone(),
            next_client: Arc::new(AtomicU64::new(1)),
        };
        Self {
            volumes: HashMap::new(),
            settings,
            launcher,
            events,
            tx,
            rx,
            handle,
        }
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Watch a volume from the start; no check is scheduled
    pub fn watch(&mut self, volume: Volume) {
        info!("Watching {} at {}", volume.identity, volume.root.display());
        self.volumes
            .insert(volume.identity.uuid, Watched::new(volume));
    }

    /// Process events until `shutdown` turns true or its sender goes away
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Coordinator running with {} volumes", self.volumes.len());
        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Coordinator stopped");
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Lock {
                client,
                privileged,
                volume,
                reply,
            } => {
                let answer = self.lock(client, privileged, volume);
                if reply.send(answer).is_err() {
                    debug!("Client {} left before its lock reply", client);
                }
            }
            Event::Unlock {
                client,
                volume,
                status,
                reply,
            } => {
                let accepted = self.unlock(client, volume, status);
                let _ = reply.send(accepted);
                if accepted {
                    self.after_release(volume, status).await;
                }
            }
            Event::ClientGone { client } => self.client_gone(client).await,
            Event::VolumeAppeared { root } => self.volume_appeared(root).await,
            Event::VolumeDisappeared { volume } => {
                if let Some(watched) = self.volumes.remove(&volume) {
                    if watched.holder.is_some() {
                        warn!("{} went away while locked", watched.volume.identity);
                    }
                    info!("Stopped watching {}", watched.volume.identity);
                }
            }
            Event::Rescan => {
                let all: Vec<Uuid> = self.volumes.keys().copied().collect();
                for volume in all {
                    self.check_rebuild(volume).await;
                }
            }
            Event::Demand { volume } => self.check_rebuild(volume).await,
            Event::Settled { volume } => {
                if let Some(watched) = self.volumes.get_mut(&volume) {
                    watched.check_scheduled = false;
                }
                self.check_rebuild(volume).await;
            }
        }
    }

    fn lock(&mut self, client: ClientId, privileged: bool, volume: Uuid) -> LockReply {
        let Some(watched) = self.volumes.get_mut(&volume) else {
            debug!("Lock request for unwatched volume {}", volume);
            return LockReply::NotRegistered;
        };
        if !privileged {
            warn!("Refusing lock on {} to unprivileged client {}", watched.volume.identity, client);
            return LockReply::Refused;
        }
        match watched.holder {
            None => {
                watched.holder = Some(client);
                info!("Client {} locked {}", client, watched.volume.identity);
                LockReply::Granted
            }
            Some(holder) => {
                debug!("{} busy (held by client {})", watched.volume.identity, holder);
                LockReply::Busy
            }
        }
    }

    fn unlock(&mut self, client: ClientId, volume: Uuid, status: ReleaseStatus) -> bool {
        let Some(watched) = self.volumes.get_mut(&volume) else {
            error!("Client {} unlocked unwatched volume {}", client, volume);
            return false;
        };
        if watched.holder != Some(client) {
            error!(
                "Client {} tried to unlock {} without holding it",
                client, watched.volume.identity
            );
            return false;
        }
        watched.holder = None;

        match status {
            ReleaseStatus::Failed => {
                watched.failures += 1;
                error!(
                    "Rebuild of {} failed (error count: {})",
                    watched.volume.identity, watched.failures
                );
            }
            ReleaseStatus::Succeeded if watched.failures > 0 => {
                info!(
                    "Rebuild of {} succeeded (previously failed)",
                    watched.volume.identity
                );
                watched.failures = 0;
            }
            ReleaseStatus::Succeeded => {
                debug!("Client {} unlocked {}", client, watched.volume.identity);
            }
        }
        true
    }

    /// Recheck after a failed rebuild, or after one that overlapped a change
    async fn after_release(&mut self, volume: Uuid, status: ReleaseStatus) {
        let Some(watched) = self.volumes.get_mut(&volume) else {
            return;
        };
        let deferred = std::mem::take(&mut watched.check_deferred);
        let retry = status == ReleaseStatus::Failed && watched.failures < self.settings.failure_limit;
        if deferred || retry {
            self.schedule_check(volume).await;
        }
    }

    async fn client_gone(&mut self, client: ClientId) {
        let held: Vec<Uuid> = self
            .volumes
            .iter()
            .filter(|(_, w)| w.holder == Some(client))
            .map(|(uuid, _)| *uuid)
            .collect();

        for volume in held {
            warn!("Client {} went away holding a lock; releasing it", client);
            if self.unlock(client, volume, ReleaseStatus::Failed) {
                self.after_release(volume, ReleaseStatus::Failed).await;
            }
        }
    }

    async fn volume_appeared(&mut self, root: PathBuf) {
        let volume = match Volume::probe(&root) {
            Ok(volume) => volume,
            Err(e) => {
                warn!("Ignoring volume at {}: {}", root.display(), e);
                return;
            }
        };
        let uuid = volume.identity.uuid;
        if !self.volumes.contains_key(&uuid) {
            self.watch(volume);
        }
        self.schedule_check(uuid).await;
    }

    /// Check after the settle delay; at most one timer per volume
    async fn schedule_check(&mut self, volume: Uuid) {
        if self.settings.settle.is_zero() {
            self.check_rebuild(volume).await;
            return;
        }
        let Some(watched) = self.volumes.get_mut(&volume) else {
            return;
        };
        if watched.check_scheduled {
            return;
        }
        watched.check_scheduled = true;

        let tx = self.tx.clone();
        let settle = self.settings.settle;
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let _ = tx.send(Event::Settled { volume });
        });
    }

    async fn check_rebuild(&mut self, volume: Uuid) {
        let Some(watched) = self.volumes.get_mut(&volume) else {
            return;
        };
        if watched.holder.is_some() {
            debug!("{} is locked; deferring check", watched.volume.identity);
            watched.check_deferred = true;
            return;
        }
        if watched.failures >= self.settings.failure_limit {
            warn!(
                "Not rebuilding {}: {} consecutive failures",
                watched.volume.identity, watched.failures
            );
            return;
        }

        let target = watched.volume.clone();
        let needed = match needs_update(&target, &self.settings) {
            Ok(needed) => needed,
            Err(e) => {
                self.record_failure(volume, &format!("checking caches: {}", e));
                return;
            }
        };
        if !needed {
            debug!("{} is up to date", target.identity);
            return;
        }

        match self.launcher.launch(&target).await {
            Ok(()) => {
                self.events
                    .log(
                        events::REBUILD_LAUNCHED,
                        &json!({
                            "volume": target.identity.uuid_string(),
                            "root": target.root.display().to_string(),
                        }),
                    )
                    .await;
            }
            Err(e) => self.record_failure(volume, &format!("launching update: {}", e)),
        }
    }

    fn record_failure(&mut self, volume: Uuid, what: &str) {
        if let Some(watched) = self.volumes.get_mut(&volume) {
            watched.failures += 1;
            error!(
                "{} failed for {} (error count: {})",
                what, watched.volume.identity, watched.failures
            );
        }
    }
}

/// Whether any artifact is out of date or any stamp is stale
fn needs_update(volume: &Volume, settings: &CoordinatorSettings) -> BootcacheResult<bool> {
    let Some(mut manifest) = CacheManifest::load_with(volume, settings.trust)? else {
        return Ok(false);
    };
    for spec in &manifest.artifacts {
        let request = BuildRequest::from_spec(spec, &settings.default_archs);
        if !artifact_is_current(&request, settings.timestamp_offset)? {
            debug!("{} is out of date", request.output.display());
            return Ok(true);
        }
    }
    Ok(staleness::evaluate_all(&mut manifest)?.any_stale)
}

/// Client connection over the coordinator's event queue.
///
/// Dropping it tells the coordinator the client is gone.
pub struct InProcessTransport {
    client: ClientId,
    privileged: bool,
    tx: mpsc::UnboundedSender<Event>,
}

impl InProcessTransport {
    pub fn client(&self) -> ClientId {
        self.client
    }
}

#[async_trait]
impl CoordinatorTransport for InProcessTransport {
    async fn request_lock(&mut self, volume: &VolumeIdentity) -> Result<LockReply, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Event::Lock {
                client: self.client,
                privileged: self.privileged,
                volume: volume.uuid,
                reply,
            })
            .map_err(|_| TransportError::Gone)?;
        rx.await.map_err(|_| TransportError::Gone)
    }

    async fn release(
        &mut self,
        volume: &VolumeIdentity,
        status: ReleaseStatus,
    ) -> Result<bool, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Event::Unlock {
                client: self.client,
                volume: volume.uuid,
                status,
                reply,
            })
            .map_err(|_| TransportError::Gone)?;
        rx.await.map_err(|_| TransportError::Gone)
    }
}

impl Drop for InProcessTransport {
    fn drop(&mut self) {
        let _ = self.tx.send(Event::ClientGone {
            client: self.client,
        });
    }
}

/// Locator handing out in-process connections
#[derive(Debug, Clone)]
pub struct InProcessLocator {
    handle: CoordinatorHandle,
    privileged: bool,
}

impl InProcessLocator {
    pub fn new(handle: CoordinatorHandle, privileged: bool) -> Self {
        Self { handle, privileged }
    }
}

#[async_trait]
impl CoordinatorLocator for InProcessLocator {
    async fn locate(&self) -> Result<Option<Box<dyn CoordinatorTransport>>, TransportError> {
        if self.handle.is_closed() {
            return Ok(None);
        }
        Ok(Some(Box::new(self.handle.connect(self.privileged))))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::error::BootcacheError;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    /// Launcher that records requests instead of spawning
    #[derive(Default)]
    pub struct RecordingLauncher {
        pub launched: Mutex<Vec<PathBuf>>,
        pub fail: AtomicBool,
    }

    impl RecordingLauncher {
        pub fn count(&self) -> usize {
            self.launched.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RebuildLauncher for RecordingLauncher {
        async fn launch(&self, volume: &Volume) -> BootcacheResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BootcacheError::Internal("launch refused".to_string()));
            }
            self.launched.lock().unwrap().push(volume.root.clone());
            Ok(())
        }
    }

    pub fn settings() -> CoordinatorSettings {
        CoordinatorSettings {
            failure_limit: 2,
            settle: Duration::ZERO,
            trust: ManifestTrust::current_user(),
            timestamp_offset: Duration::from_secs(1),
            default_archs: vec![ArchId::from_name("i386").unwrap()],
        }
    }

    /// Start a coordinator watching `volumes`; keep the sender alive
    pub fn start(
        settings: CoordinatorSettings,
        launcher: Arc<RecordingLauncher>,
        volumes: Vec<Volume>,
    ) -> (CoordinatorHandle, watch::Sender<bool>) {
        let mut coordinator = Coordinator::new(settings, launcher, EventLog::disabled());
        for volume in volumes {
            coordinator.watch(volume);
        }
        let handle = coordinator.handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(coordinator.run(shutdown_rx));
        (handle, shutdown_tx)
    }

    /// Wait until every event queued so far has been handled
    pub async fn settle(handle: &CoordinatorHandle) {
        let mut probe = handle.connect(true);
        let unwatched = VolumeIdentity::new(Uuid::nil(), "barrier");
        let _ = probe.request_lock(&unwatched).await;
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::lock::{LockPolicy, TokenKind, VolumeLock};
    use crate::manifest::test_support::write_manifest;
    use tempfile::TempDir;

    fn volume(dir: &TempDir, n: u128) -> Volume {
        Volume::probe(dir.path())
            .unwrap()
            .with_identity(Some(Uuid::from_u128(n)), Some(format!("vol{}", n)))
    }

    /// A volume whose mkext has never been built
    fn stale_volume(dir: &TempDir, n: u128) -> Volume {
        write_manifest(
            dir.path(),
            r#"
[postboot.mkext]
path = "System/Library/Extensions.mkext"
extensions_dir = "System/Library/Extensions"
"#,
        );
        std::fs::create_dir_all(dir.path().join("System/Library/Extensions")).unwrap();
        volume(dir, n)
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir, 1);
        let (handle, _shutdown) = start(settings(), Arc::default(), vec![vol.clone()]);

        let mut first = handle.connect(true);
        let mut second = handle.connect(true);

        assert_eq!(first.request_lock(&vol.identity).await.unwrap(), LockReply::Granted);
        assert_eq!(second.request_lock(&vol.identity).await.unwrap(), LockReply::Busy);
        // holder asking again is still busy
        assert_eq!(first.request_lock(&vol.identity).await.unwrap(), LockReply::Busy);

        assert!(first.release(&vol.identity, ReleaseStatus::Succeeded).await.unwrap());
        assert_eq!(second.request_lock(&vol.identity).await.unwrap(), LockReply::Granted);
    }

    #[tokio::test]
    async fn unwatched_and_unprivileged() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir, 1);
        let (handle, _shutdown) = start(settings(), Arc::default(), vec![vol.clone()]);

        let other = VolumeIdentity::new(Uuid::from_u128(99), "other");
        let mut client = handle.connect(true);
        assert_eq!(client.request_lock(&other).await.unwrap(), LockReply::NotRegistered);

        let mut user = handle.connect(false);
        assert_eq!(user.request_lock(&vol.identity).await.unwrap(), LockReply::Refused);
    }

    #[tokio::test]
    async fn only_the_holder_may_unlock() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir, 1);
        let (handle, _shutdown) = start(settings(), Arc::default(), vec![vol.clone()]);

        let mut holder = handle.connect(true);
        let mut intruder = handle.connect(true);
        holder.request_lock(&vol.identity).await.unwrap();

        assert!(!intruder.release(&vol.identity, ReleaseStatus::Succeeded).await.unwrap());
        assert_eq!(intruder.request_lock(&vol.identity).await.unwrap(), LockReply::Busy);
    }

    #[tokio::test]
    async fn dropped_client_releases_its_lock() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir, 1);
        let (handle, _shutdown) = start(settings(), Arc::default(), vec![vol.clone()]);

        let mut holder = handle.connect(true);
        holder.request_lock(&vol.identity).await.unwrap();
        drop(holder);

        let mut next = handle.connect(true);
        assert_eq!(next.request_lock(&vol.identity).await.unwrap(), LockReply::Granted);
    }

    #[tokio::test]
    async fn failures_are_counted_and_capped() {
        let dir = TempDir::new().unwrap();
        let vol = stale_volume(&dir, 1);
        let launcher = Arc::new(RecordingLauncher::default());
        let (handle, _shutdown) = start(settings(), launcher.clone(), vec![vol.clone()]);
        let mut client = handle.connect(true);

        handle.demand(vol.identity.uuid);
        settle(&handle).await;
        assert_eq!(launcher.count(), 1);

        // first failure is below the limit of 2: recheck launches again
        client.request_lock(&vol.identity).await.unwrap();
        client.release(&vol.identity, ReleaseStatus::Failed).await.unwrap();
        settle(&handle).await;
        assert_eq!(launcher.count(), 2);

        // second failure reaches the limit: no more launches
        client.request_lock(&vol.identity).await.unwrap();
        client.release(&vol.identity, ReleaseStatus::Failed).await.unwrap();
        handle.demand(vol.identity.uuid);
        settle(&handle).await;
        assert_eq!(launcher.count(), 2);

        // a success resets the count
        client.request_lock(&vol.identity).await.unwrap();
        client.release(&vol.identity, ReleaseStatus::Succeeded).await.unwrap();
        handle.demand(vol.identity.uuid);
        settle(&handle).await;
        assert_eq!(launcher.count(), 3);
    }

    #[tokio::test]
    async fn launch_failure_counts() {
        let dir = TempDir::new().unwrap();
        let vol = stale_volume(&dir, 1);
        let launcher = Arc::new(RecordingLauncher::default());
        launcher.fail.store(true, Ordering::SeqCst);
        let (handle, _shutdown) = start(settings(), launcher.clone(), vec![vol.clone()]);

        handle.demand(vol.identity.uuid);
        handle.demand(vol.identity.uuid);
        settle(&handle).await;
        launcher.fail.store(false, Ordering::SeqCst);
        handle.rescan();
        settle(&handle).await;
        // two failed launches hit the limit before the rescan
        assert_eq!(launcher.count(), 0);
    }

    #[tokio::test]
    async fn check_is_deferred_while_locked() {
        let dir = TempDir::new().unwrap();
        let vol = stale_volume(&dir, 1);
        let launcher = Arc::new(RecordingLauncher::default());
        let (handle, _shutdown) = start(settings(), launcher.clone(), vec![vol.clone()]);

        let mut client = handle.connect(true);
        client.request_lock(&vol.identity).await.unwrap();
        handle.rescan();
        settle(&handle).await;
        assert_eq!(launcher.count(), 0);

        client.release(&vol.identity, ReleaseStatus::Succeeded).await.unwrap();
        settle(&handle).await;
        assert_eq!(launcher.count(), 1);
    }

    #[tokio::test]
    async fn appeared_volume_is_checked() {
        let dir = TempDir::new().unwrap();
        stale_volume(&dir, 1);
        let launcher = Arc::new(RecordingLauncher::default());
        let (handle, _shutdown) = start(settings(), launcher.clone(), vec![]);

        handle.volume_appeared(dir.path());
        settle(&handle).await;
        assert_eq!(launcher.count(), 1);

        let probed = Volume::probe(dir.path()).unwrap();
        handle.volume_disappeared(probed.identity.uuid);
        let mut client = handle.connect(true);
        assert_eq!(
            client.request_lock(&probed.identity).await.unwrap(),
            LockReply::NotRegistered
        );
    }

    #[tokio::test]
    async fn volume_lock_waits_for_the_holder() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir, 1);
        let (handle, _shutdown) = start(settings(), Arc::default(), vec![vol.clone()]);

        let policy = LockPolicy {
            retry_delay: Duration::from_millis(20),
            max_retries: 50,
        };
        let lock = Arc::new(
            VolumeLock::new(Arc::new(InProcessLocator::new(handle.clone(), true)), policy)
                .with_privileged(true),
        );

        let first = lock.acquire(&vol.identity).await.unwrap();
        assert_eq!(first.kind(), TokenKind::Coordinated);

        let waiter = {
            let lock = lock.clone();
            let identity = vol.identity.clone();
            tokio::spawn(async move { lock.acquire(&identity).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.release(ReleaseStatus::Succeeded).await;

        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.kind(), TokenKind::Coordinated);
        assert!(second.busy_retries() >= 1);
        second.release(ReleaseStatus::Succeeded).await;
    }

    #[tokio::test]
    async fn stopped_coordinator_fails_open() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir, 1);
        let (handle, shutdown) = start(settings(), Arc::default(), vec![vol.clone()]);
        shutdown.send(true).unwrap();
        while !handle.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let lock = VolumeLock::new(Arc::new(InProcessLocator::new(handle, true)), LockPolicy::default())
            .with_privileged(true);
        let token = lock.acquire(&vol.identity).await.unwrap();
        assert_eq!(token.kind(), TokenKind::FailOpen);
    }
}
