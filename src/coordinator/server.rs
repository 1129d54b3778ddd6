//! Unix socket front end for the coordinator
//!
//! Each accepted connection is one client. Requests are newline-delimited
//! JSON `ClientMessage`s answered with one `ServerMessage` each. Closing the
//! connection releases any lock the client holds.

use super::{ClientId, CoordinatorHandle, Event};
use crate::error::{BootcacheError, BootcacheResult};
use crate::lock::protocol::{ClientMessage, ServerMessage};
use std::io::ErrorKind;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Longest request line a client may send
pub const MAX_REQUEST_LINE: u64 = 64 * 1024;

/// Bind the coordinator socket, replacing a stale one
pub fn bind(path: &Path) -> BootcacheResult<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(BootcacheError::io(
                format!("removing stale socket {}", path.display()),
                e,
            ))
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| BootcacheError::io(format!("creating {}", parent.display()), e))?;
    }
    UnixListener::bind(path)
        .map_err(|e| BootcacheError::io(format!("binding {}", path.display()), e))
}

/// Accept connections until `shutdown` turns true.
///
/// With `require_root`, only peers running as uid 0 may take locks.
pub async fn serve(
    listener: UnixListener,
    handle: CoordinatorHandle,
    require_root: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let privileged = !require_root || peer_is_root(&stream);
                    let client = handle.next_client();
                    debug!("Client {} connected (privileged: {})", client, privileged);
                    tokio::spawn(connection(stream, client, privileged, handle.clone()));
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Coordinator socket closed");
}

fn peer_is_root(stream: &UnixStream) -> bool {
    match stream.peer_cred() {
        Ok(cred) => cred.uid() == 0,
        Err(e) => {
            warn!("Could not read peer credentials: {}", e);
            false
        }
    }
}

async fn connection(stream: UnixStream, client: ClientId, privileged: bool, handle: CoordinatorHandle) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();

    loop {
        line.clear();
        let read = match (&mut reader).take(MAX_REQUEST_LINE).read_line(&mut line).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) => {
                debug!("Client {} read failed: {}", client, e);
                break;
            }
        };
        if read as u64 >= MAX_REQUEST_LINE && !line.ends_with('\n') {
            warn!("Client {} sent a request over {} bytes", client, MAX_REQUEST_LINE);
            break;
        }

        let message: ClientMessage = match serde_json::from_str(line.trim_end()) {
            Ok(message) => message,
            Err(e) => {
                warn!("Client {} sent a malformed request: {}", client, e);
                break;
            }
        };

        let Some(reply) = dispatch(&handle, client, privileged, message).await else {
            break;
        };

        let mut out = match serde_json::to_string(&reply) {
            Ok(out) => out,
            Err(e) => {
                warn!("Could not encode reply for client {}: {}", client, e);
                break;
            }
        };
        out.push('\n');
        if let Err(e) = write.write_all(out.as_bytes()).await {
            debug!("Client {} write failed: {}", client, e);
            break;
        }
    }

    debug!("Client {} disconnected", client);
    handle.send(Event::ClientGone { client });
}

/// Forward one request; `None` once the coordinator has stopped
async fn dispatch(
    handle: &CoordinatorHandle,
    client: ClientId,
    privileged: bool,
    message: ClientMessage,
) -> Option<ServerMessage> {
    match message {
        ClientMessage::Lock { volume } => {
            let (reply, rx) = oneshot::channel();
            if !handle.send(Event::Lock {
                client,
                privileged,
                volume,
                reply,
            }) {
                return None;
            }
            rx.await.ok().map(|reply| ServerMessage::LockReply { reply })
        }
        ClientMessage::Unlock { volume, status } => {
            let (reply, rx) = oneshot::channel();
            if !handle.send(Event::Unlock {
                client,
                volume,
                status,
                reply,
            }) {
                return None;
            }
            rx.await.ok().map(|accepted| ServerMessage::UnlockAck { accepted })
        }
    }
}
