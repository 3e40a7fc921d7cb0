//! Messages exchanged between processes of one device over the sync bus

use serde::{Deserialize, Serialize};

use crate::remote::{Envelope, VersionStamp};
use crate::snapshot::DomainSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// Follower asks the leader to write its snapshot
    PushRequest {
        from: String,
        snapshot: DomainSnapshot,
        /// Sender's local revision when the snapshot was taken
        revision: u64,
        /// Remote revision the snapshot was edited on top of
        base: Option<VersionStamp>,
    },

    /// A remote revision the leader wrote or applied
    Confirmed {
        from: String,
        /// Process and local revision this write carried; `None` when the
        /// leader is rebroadcasting a revision it pulled
        origin: Option<RelayOrigin>,
        envelope: Envelope,
    },

    /// Newly connected follower asks for the leader's baseline
    SyncRequest { from: String },

    /// Leader could not write a relayed snapshot
    WriteFailed {
        from: String,
        origin: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayOrigin {
    pub process_id: String,
    pub revision: u64,
}

impl BusMessage {
    pub fn sender(&self) -> &str {
        match self {
            BusMessage::PushRequest { from, .. }
            | BusMessage::Confirmed { from, .. }
            | BusMessage::SyncRequest { from }
            | BusMessage::WriteFailed { from, .. } => from,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BusMessage::PushRequest { .. } => "push_request",
            BusMessage::Confirmed { .. } => "confirmed",
            BusMessage::SyncRequest { .. } => "sync_request",
            BusMessage::WriteFailed { .. } => "write_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_is_tagged() {
        let msg = BusMessage::SyncRequest {
            from: "p1".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, serde_json::json!({ "type": "sync_request", "from": "p1" }));
        assert_eq!(msg.sender(), "p1");
    }
}
