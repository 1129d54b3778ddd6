//! Unix socket client for the lock coordinator
//!
//! Messages are newline-delimited JSON. A missing socket, or one nobody is
//! listening on, means no coordinator is registered.

use super::protocol::{ClientMessage, LockReply, ReleaseStatus, ServerMessage};
use super::transport::{CoordinatorLocator, CoordinatorTransport, TransportError};
use crate::volume::VolumeIdentity;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

/// Locates the coordinator by its socket path
#[derive(Debug, Clone)]
pub struct SocketLocator {
    path: PathBuf,
}

impl SocketLocator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CoordinatorLocator for SocketLocator {
    async fn locate(&self) -> Result<Option<Box<dyn CoordinatorTransport>>, TransportError> {
        match UnixStream::connect(&self.path).await {
            Ok(stream) => {
                debug!("Connected to coordinator at {}", self.path.display());
                Ok(Some(Box::new(SocketTransport::new(stream))))
            }
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                debug!("No coordinator at {}: {}", self.path.display(), e);
                Ok(None)
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

/// One connection to the coordinator socket
pub struct SocketTransport {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SocketTransport {
    pub fn new(stream: UnixStream) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn exchange(&mut self, message: &ClientMessage) -> Result<ServerMessage, TransportError> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        line.push('\n');
        if let Err(e) = self.writer.write_all(line.as_bytes()).await {
            return Err(gone_or_io(e));
        }

        let mut reply = String::new();
        let read = self.reader.read_line(&mut reply).await.map_err(gone_or_io)?;
        if read == 0 {
            return Err(TransportError::Gone);
        }
        serde_json::from_str(reply.trim_end()).map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

fn gone_or_io(e: std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof => {
            TransportError::Gone
        }
        _ => TransportError::Io(e),
    }
}

#[async_trait]
impl CoordinatorTransport for SocketTransport {
    async fn request_lock(&mut self, volume: &VolumeIdentity) -> Result<LockReply, TransportError> {
        let message = ClientMessage::Lock {
            volume: volume.uuid,
        };
        match self.exchange(&message).await? {
            ServerMessage::LockReply { reply } => Ok(reply),
            other => Err(TransportError::Protocol(format!(
                "expected lock reply, got {:?}",
                other
            ))),
        }
    }

    async fn release(
        &mut self,
        volume: &VolumeIdentity,
        status: ReleaseStatus,
    ) -> Result<bool, TransportError> {
        let message = ClientMessage::Unlock {
            volume: volume.uuid,
            status,
        };
        match self.exchange(&message).await? {
            ServerMessage::UnlockAck { accepted } => Ok(accepted),
            other => Err(TransportError::Protocol(format!(
                "expected unlock ack, got {:?}",
                other
            ))),
        }
    }
}
