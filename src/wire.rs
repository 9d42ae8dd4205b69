// src/wire.rs
// Wire message types exchanged over signaling channels.
//
// One tagged enum covers every message shape used by the namespace engine,
// the session manager, and the rendezvous scheduler. Channels carry JSON;
// `serde`'s internally-tagged representation keeps each message
// self-describing without a separate framing layer.

use serde::{Deserialize, Serialize};

/// All messages exchanged over a `SignalingChannel`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Message {
    // -- Handshake (Session Manager) --
    /// Opens a persistent session: proves authorship of `public_key` over the
    /// announced `persistent_id` at time `ts`.
    #[serde(rename = "request")]
    Request {
        friendly_name: String,
        public_key: String,
        persistent_id: String,
        ts: i64,
        signature: String,
    },
    #[serde(rename = "accepted")]
    Accepted {
        persistent_id: String,
        discovery_uuid: String,
    },
    #[serde(rename = "confirm")]
    Confirm {
        persistent_id: String,
        friendly_name: String,
        discovery_uuid: String,
        public_key: String,
    },
    #[serde(rename = "rejected")]
    Rejected {},

    // -- Session --
    /// Sent immediately on channel-open for a persistent session; signed the
    /// same way as `request`.
    #[serde(rename = "hello")]
    Hello {
        friendly_name: String,
        public_key: String,
        ts: i64,
        signature: String,
    },

    // -- Text --
    #[serde(rename = "message")]
    Text {
        id: String,
        ts: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        e2e: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iv: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ct: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sig: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    #[serde(rename = "message-ack")]
    MessageAck { id: String },
    #[serde(rename = "message-edit")]
    MessageEdit {
        id: String,
        ts: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        e2e: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iv: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ct: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sig: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    #[serde(rename = "message-delete")]
    MessageDelete { id: String },

    // -- File transfer (sketch only; chunking lives outside this crate) --
    #[serde(rename = "file-start")]
    FileStart {
        tid: String,
        name: String,
        size: u64,
        total: u32,
    },
    #[serde(rename = "file-chunk")]
    FileChunk {
        tid: String,
        index: u32,
        chunk: String,
    },
    #[serde(rename = "file-end")]
    FileEnd { tid: String },
    #[serde(rename = "file-ack")]
    FileAck { tid: String },

    // -- Namespace --
    #[serde(rename = "checkin")]
    Checkin {
        discovery_id: String,
        friendly_name: String,
        public_key: String,
    },
    #[serde(rename = "registry")]
    Registry { peers: Vec<RegistryPeer> },
    #[serde(rename = "ping")]
    Ping {},
    #[serde(rename = "pong")]
    Pong {},
    #[serde(rename = "migrate")]
    Migrate { level: u8 },
    #[serde(rename = "reverse-welcome")]
    ReverseWelcome {},

    // -- Rendezvous --
    #[serde(rename = "rvz-exchange")]
    RvzExchange {
        persistent_id: String,
        friendly_name: String,
        public_key: String,
        ts: i64,
        signature: String,
    },

    // -- Session name propagation --
    #[serde(rename = "name-update")]
    NameUpdate { name: String },
}

/// One entry in a `registry` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryPeer {
    pub discovery_id: String,
    pub friendly_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl Message {
    /// A short tag for logging without dumping the full payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::Accepted { .. } => "accepted",
            Message::Confirm { .. } => "confirm",
            Message::Rejected {} => "rejected",
            Message::Hello { .. } => "hello",
            Message::Text { .. } => "message",
            Message::MessageAck { .. } => "message-ack",
            Message::MessageEdit { .. } => "message-edit",
            Message::MessageDelete { .. } => "message-delete",
            Message::FileStart { .. } => "file-start",
            Message::FileChunk { .. } => "file-chunk",
            Message::FileEnd { .. } => "file-end",
            Message::FileAck { .. } => "file-ack",
            Message::Checkin { .. } => "checkin",
            Message::Registry { .. } => "registry",
            Message::Ping {} => "ping",
            Message::Pong {} => "pong",
            Message::Migrate { .. } => "migrate",
            Message::ReverseWelcome {} => "reverse-welcome",
            Message::RvzExchange { .. } => "rvz-exchange",
            Message::NameUpdate { .. } => "name-update",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkin_round_trips_through_json() {
        let msg = Message::Checkin {
            discovery_id: "pfx-abc123".to_string(),
            friendly_name: "alice".to_string(),
            public_key: "base64key".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"checkin\""));
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn registry_carries_optional_public_key() {
        let msg = Message::Registry {
            peers: vec![
                RegistryPeer {
                    discovery_id: "pfx-1".to_string(),
                    friendly_name: "a".to_string(),
                    public_key: Some("pk-a".to_string()),
                },
                RegistryPeer {
                    discovery_id: "pfx-2".to_string(),
                    friendly_name: "b".to_string(),
                    public_key: None,
                },
            ],
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn e2e_text_message_omits_plaintext_content() {
        let msg = Message::Text {
            id: "m1".to_string(),
            ts: 1000,
            e2e: Some(true),
            iv: Some("iv".to_string()),
            ct: Some("ct".to_string()),
            sig: Some("sig".to_string()),
            content: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("\"content\""));
    }

    #[test]
    fn kind_tags_every_variant_distinctly() {
        assert_eq!(Message::Ping {}.kind(), "ping");
        assert_eq!(Message::Pong {}.kind(), "pong");
        assert_ne!(Message::Ping {}.kind(), Message::Pong {}.kind());
    }
}
