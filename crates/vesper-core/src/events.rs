use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::TabId;

/// Local events republished by the realtime hub for UI consumption.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum RealtimeEvent {
    /// Inbound envelope received on a topic socket.
    #[serde(rename = "message")]
    Message {
        topic: String,
        kind: String,
        #[serde(default)]
        data: Value,
    },

    #[serde(rename = "connected")]
    Connected { topic: String },

    /// Socket closed; a reconnect is scheduled.
    #[serde(rename = "reconnecting")]
    Reconnecting {
        topic: String,
        attempt: u32,
        delay_ms: u64,
    },

    /// Terminal. No reconnect happens until an explicit restart.
    #[serde(rename = "connection_failed")]
    ConnectionFailed { topic: String, reason: String },
}

impl RealtimeEvent {
    pub fn topic(&self) -> &str {
        match self {
            Self::Message { topic, .. }
            | Self::Connected { topic }
            | Self::Reconnecting { topic, .. }
            | Self::ConnectionFailed { topic, .. } => topic,
        }
    }
}

/// Messages exchanged on the "auth" cross-tab channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthBroadcast {
    Logout {
        /// Unix milliseconds at the originating tab.
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<TabId>,
    },
}
