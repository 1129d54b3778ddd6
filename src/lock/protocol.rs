//! Lock protocol messages
//!
//! The same types travel over the in-process channel transport and, as
//! newline-delimited JSON, over the coordinator's Unix socket.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Coordinator answer to a lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReply {
    /// The caller now holds the volume
    Granted,
    /// Another client holds the volume
    Busy,
    /// The coordinator does not watch this volume; proceed unlocked
    NotRegistered,
    /// The coordinator will not serve this caller
    Refused,
}

impl fmt::Display for LockReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Granted => "granted",
            Self::Busy => "busy",
            Self::NotRegistered => "not registered",
            Self::Refused => "refused",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of the work done under a lock, reported on release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Succeeded,
    Failed,
}

impl ReleaseStatus {
    pub fn from_success(ok: bool) -> Self {
        if ok {
            Self::Succeeded
        } else {
            Self::Failed
        }
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Client to coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Lock { volume: Uuid },
    Unlock { volume: Uuid, status: ReleaseStatus },
}

/// Coordinator to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    LockReply { reply: LockReply },
    UnlockAck { accepted: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_tagged() {
        let volume = Uuid::nil();
        let line = serde_json::to_string(&ClientMessage::Unlock {
            volume,
            status: ReleaseStatus::Failed,
        })
        .unwrap();
        assert_eq!(
            line,
            r#"{"type":"unlock","volume":"00000000-0000-0000-0000-000000000000","status":"failed"}"#
        );

        let reply: ServerMessage =
            serde_json::from_str(r#"{"type":"lock_reply","reply":"not_registered"}"#).unwrap();
        assert_eq!(
            reply,
            ServerMessage::LockReply {
                reply: LockReply::NotRegistered
            }
        );
    }
}
