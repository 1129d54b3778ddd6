//! Coordinator transport abstraction
//!
//! A locator finds the coordinator (or reports that none is registered); a
//! transport is one client connection to it. The connection doubles as the
//! client's identity: when it closes, the coordinator drops any lock the
//! client still holds.

use super::protocol::{LockReply, ReleaseStatus};
use crate::volume::VolumeIdentity;
use async_trait::async_trait;
use thiserror::Error;

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    /// The coordinator exited or closed the connection
    #[error("coordinator went away")]
    Gone,

    #[error("coordinator I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed coordinator message: {0}")]
    Protocol(String),
}

/// One client connection to a coordinator
#[async_trait]
pub trait CoordinatorTransport: Send + Sync {
    /// Ask for the volume's lock
    async fn request_lock(&mut self, volume: &VolumeIdentity) -> Result<LockReply, TransportError>;

    /// Hand the lock back with the outcome of the work; `false` if the
    /// coordinator did not consider us the holder
    async fn release(
        &mut self,
        volume: &VolumeIdentity,
        status: ReleaseStatus,
    ) -> Result<bool, TransportError>;
}

/// Finds a coordinator
#[async_trait]
pub trait CoordinatorLocator: Send + Sync {
    /// `Ok(None)` when no coordinator is registered
    async fn locate(&self) -> Result<Option<Box<dyn CoordinatorTransport>>, TransportError>;
}

/// Locator for environments that never run a coordinator
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCoordinator;

#[async_trait]
impl CoordinatorLocator for NoCoordinator {
    async fn locate(&self) -> Result<Option<Box<dyn CoordinatorTransport>>, TransportError> {
        Ok(None)
    }
}
