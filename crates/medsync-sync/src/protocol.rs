//! # Change Feed Protocol Messages
//!
//! Message types exchanged with the change feed over the WebSocket.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Change Feed Protocol Messages                        │
//! │                                                                         │
//! │  SUBSCRIPTION                                                          │
//! │  ────────────                                                          │
//! │  Client ───► Subscribe { channel, table, filter?, events, token? }     │
//! │  Server ───► Subscribed { channel }                                    │
//! │  Server ───► ChannelError { channel, message }   (subscription denied) │
//! │  Client ───► Unsubscribe { channel }                                   │
//! │                                                                         │
//! │  CHANGES                                                               │
//! │  ───────                                                               │
//! │  Server ───► Change { channel, table, operation }                      │
//! │                                                                         │
//! │  SESSION                                                               │
//! │  ───────                                                               │
//! │  Client ───► AccessToken { token }   (token refresh, all channels)     │
//! │                                                                         │
//! │  KEEPALIVE / ERROR                                                     │
//! │  ─────────────────                                                     │
//! │  Both      ◄──► Ping { timestamp } / Pong { timestamp }                │
//! │  Server    ───► Error { code, message }                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Adjacently tagged JSON:
//! ```json
//! { "type": "Change", "payload": { "channel": "realtime:medicines:*:1", "table": "medicines", "operation": "insert" } }
//! ```

use medsync_core::{ChangeOperation, EventMask, RowFilter};
use serde::{Deserialize, Serialize};

// =============================================================================
// Main Message Enum (Tagged Union)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum FeedMessage {
    // =========================================================================
    // Subscription Messages
    // =========================================================================
    Subscribe(SubscribePayload),

    /// Server confirmation that a channel is live.
    Subscribed { channel: String },

    Unsubscribe { channel: String },

    /// Server refused or dropped a channel.
    ChannelError { channel: String, message: String },

    // =========================================================================
    // Change Messages
    // =========================================================================
    Change(ChangePayload),

    // =========================================================================
    // Session Messages
    // =========================================================================
    /// Replaces the access token used to authorize every channel.
    AccessToken { token: String },

    // =========================================================================
    // Keepalive Messages
    // =========================================================================
    Ping { timestamp: String },

    Pong { timestamp: String },

    // =========================================================================
    // Error Messages
    // =========================================================================
    Error { code: String, message: String },
}

// =============================================================================
// Payloads
// =============================================================================

/// Request to open a logical channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub channel: String,

    pub table: String,

    /// `<column>=eq.<value>`; absent for unfiltered channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<RowFilter>,

    #[serde(default)]
    pub events: EventMask,

    /// Session token for authenticated channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// A change delivered on a channel. No row data is included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePayload {
    pub channel: String,
    pub table: String,
    pub operation: ChangeOperation,
}

// =============================================================================
// Helper Functions
// =============================================================================

impl FeedMessage {
    /// Returns the message type name as a string (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            FeedMessage::Subscribe(_) => "Subscribe",
            FeedMessage::Subscribed { .. } => "Subscribed",
            FeedMessage::Unsubscribe { .. } => "Unsubscribe",
            FeedMessage::ChannelError { .. } => "ChannelError",
            FeedMessage::Change(_) => "Change",
            FeedMessage::AccessToken { .. } => "AccessToken",
            FeedMessage::Ping { .. } => "Ping",
            FeedMessage::Pong { .. } => "Pong",
            FeedMessage::Error { .. } => "Error",
        }
    }

    pub fn unsubscribe(channel: &str) -> Self {
        FeedMessage::Unsubscribe {
            channel: channel.to_string(),
        }
    }

    pub fn ping() -> Self {
        FeedMessage::Ping {
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn pong() -> Self {
        FeedMessage::Pong {
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
