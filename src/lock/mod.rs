//! Advisory per-volume build lock
//!
//! Privileged rebuilders ask a coordinator for a volume's lock before
//! touching its caches. The protocol is cooperative: nothing stops a process
//! that never asks.
//!
//! # Acquisition
//!
//! | Situation | Outcome |
//! |-----------|---------|
//! | Caller unprivileged | Token immediately, no coordinator contact |
//! | No coordinator registered | Token immediately (fail open) |
//! | Coordinator does not watch the volume | Token immediately (fail open) |
//! | Coordinator went away mid-request | Token immediately (fail open) |
//! | Volume busy | Retry after a fixed delay, bounded count |
//! | Retries exhausted | `LockError::Timeout` |
//! | Coordinator refuses | `LockError::Refused` |

pub mod protocol;
pub mod socket;
pub mod transport;

pub use protocol::{LockReply, ReleaseStatus};
pub use socket::SocketLocator;
pub use transport::{CoordinatorLocator, CoordinatorTransport, NoCoordinator, TransportError};

use crate::config::schema::LockConfig;
use crate::volume::VolumeIdentity;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Lock acquisition failures
#[derive(Debug, Error)]
pub enum LockError {
    #[error("volume {volume} still busy after waiting {waited:?}")]
    Timeout { volume: String, waited: Duration },

    #[error("coordinator refused the lock for {volume}")]
    Refused { volume: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Retry behaviour while a volume is busy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub retry_delay: Duration,
    pub max_retries: u32,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(30),
            max_retries: 10,
        }
    }
}

impl From<&LockConfig> for LockPolicy {
    fn from(config: &LockConfig) -> Self {
        Self {
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            max_retries: config.max_retries,
        }
    }
}

/// How a token came to be held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Granted by a coordinator; released back to it
    Coordinated,
    /// Caller is unprivileged and never contends
    Unprivileged,
    /// No coordinator to contend through
    FailOpen,
}

/// Proof of holding a volume's lock. Release it exactly once.
pub struct LockToken {
    volume: VolumeIdentity,
    kind: TokenKind,
    transport: Option<Box<dyn CoordinatorTransport>>,
    busy_retries: u32,
}

impl std::fmt::Debug for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockToken")
            .field("volume", &self.volume)
            .field("kind", &self.kind)
            .field("busy_retries", &self.busy_retries)
            .finish()
    }
}

impl LockToken {
    fn uncoordinated(volume: &VolumeIdentity, kind: TokenKind, busy_retries: u32) -> Self {
        Self {
            volume: volume.clone(),
            kind,
            transport: None,
            busy_retries,
        }
    }

    pub fn volume(&self) -> &VolumeIdentity {
        &self.volume
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    /// How many `Busy` answers preceded the grant
    pub fn busy_retries(&self) -> u32 {
        self.busy_retries
    }

    /// Hand the lock back, reporting the outcome of the work.
    ///
    /// Local resources are released even when the coordinator cannot be told.
    pub async fn release(mut self, status: ReleaseStatus) {
        let Some(mut transport) = self.transport.take() else {
            debug!("Released {:?} lock on {}", self.kind, self.volume);
            return;
        };

        match transport.release(&self.volume, status).await {
            Ok(true) => info!("Released lock on {} ({:?})", self.volume, status),
            Ok(false) => warn!("Coordinator did not recognise our lock on {}", self.volume),
            Err(e) => warn!("Could not report release of {}: {}", self.volume, e),
        }
    }
}

/// Client side of the volume lock
pub struct VolumeLock {
    locator: Arc<dyn CoordinatorLocator>,
    policy: LockPolicy,
    privileged: bool,
}

impl VolumeLock {
    /// Create a lock client; privilege is taken from the process
    pub fn new(locator: Arc<dyn CoordinatorLocator>, policy: LockPolicy) -> Self {
        Self {
            locator,
            policy,
            privileged: crate::privilege::is_privileged(),
        }
    }

    /// Override the privilege check
    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Acquire the lock for `volume`
    pub async fn acquire(&self, volume: &VolumeIdentity) -> Result<LockToken, LockError> {
        if !self.privileged {
            debug!("Unprivileged caller; not locking {}", volume);
            return Ok(LockToken::uncoordinated(volume, TokenKind::Unprivileged, 0));
        }

        let mut transport = match self.locator.locate().await {
            Ok(Some(transport)) => transport,
            Ok(None) | Err(TransportError::Gone) => {
                info!("No lock coordinator; proceeding without a lock on {}", volume);
                return Ok(LockToken::uncoordinated(volume, TokenKind::FailOpen, 0));
            }
            Err(e) => return Err(e.into()),
        };

        let mut busy_retries = 0;
        loop {
            match transport.request_lock(volume).await {
                Ok(LockReply::Granted) => {
                    info!("Locked {}", volume);
                    return Ok(LockToken {
                        volume: volume.clone(),
                        kind: TokenKind::Coordinated,
                        transport: Some(transport),
                        busy_retries,
                    });
                }
                Ok(LockReply::NotRegistered) => {
                    debug!("Coordinator does not watch {}; proceeding unlocked", volume);
                    return Ok(LockToken::uncoordinated(
                        volume,
                        TokenKind::FailOpen,
                        busy_retries,
                    ));
                }
                Ok(LockReply::Refused) => {
                    return Err(LockError::Refused {
                        volume: volume.label.clone(),
                    })
                }
                Ok(LockReply::Busy) => {
                    if busy_retries >= self.policy.max_retries {
                        return Err(LockError::Timeout {
                            volume: volume.label.clone(),
                            waited: self.policy.retry_delay * busy_retries,
                        });
                    }
                    busy_retries += 1;
                    warn!(
                        "{} is busy; retry {}/{} in {:?}",
                        volume, busy_retries, self.policy.max_retries, self.policy.retry_delay
                    );
                    tokio::time::sleep(self.policy.retry_delay).await;
                }
                Err(TransportError::Gone) => {
                    warn!("Lock coordinator went away; proceeding without a lock on {}", volume);
                    return Ok(LockToken::uncoordinated(
                        volume,
                        TokenKind::FailOpen,
                        busy_retries,
                    ));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
