//! # Sync Error Types
//!
//! Error types for engine operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │    Session      │  │     Data Service        │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  AuthUnavailable│  │  ServerError            │ │
//! │  │  InvalidUrl     │  │  InvalidSession │  │  Unsupported            │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Network      │  │  Change Feed    │  │      Protocol           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  NetworkFailure │  │  ChannelError   │  │  InvalidMessage         │ │
//! │  │  Timeout        │  │  Disconnected   │  │  DeserializationFailed  │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Handling Policy
//! ```text
//!   AuthUnavailable   → fetch skipped, loading flag stays raised
//!   Network/Timeout   → warn, cache untouched, flag cleared
//!   ServerError       → ActionResult::Failed { error, code }
//!   ChannelError      → warn, category degrades to initial fetch only
//!   Unsupported       → ActionResult::Failed { code: 405 }
//! ```

use std::fmt;

use medsync_core::{CoreError, SourceKind};
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Engine error type covering every runtime failure.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid engine configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid service URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// No valid session; the request was not sent.
    #[error("No valid session available")]
    AuthUnavailable,

    /// Access token could not be decoded.
    #[error("Invalid session token: {0}")]
    InvalidSession(String),

    // =========================================================================
    // Network Errors
    // =========================================================================
    /// Request could not reach the Data Service.
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// Request or connection timed out.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Failed to establish the change feed socket.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Change feed socket closed unexpectedly.
    #[error("Disconnected from change feed")]
    Disconnected,

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Data Service Errors
    // =========================================================================
    /// Non-success response. `code` is the body's code, or the HTTP status
    /// when the body carries none.
    #[error("Server error {code}: {message}")]
    ServerError {
        status: u16,
        code: u16,
        message: String,
    },

    /// Capability not offered by this source kind.
    #[error("{operation} is not supported for {kind} sources")]
    Unsupported {
        operation: &'static str,
        kind: SourceKind,
    },

    // =========================================================================
    // Change Feed Errors
    // =========================================================================
    /// A logical channel failed to subscribe or was closed by the server.
    #[error("Channel {channel} failed: {message}")]
    ChannelError { channel: String, message: String },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Invalid message received.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to serialize a message or body.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize a message or body.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    // =========================================================================
    // Domain Errors
    // =========================================================================
    #[error(transparent)]
    Core(#[from] CoreError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Engine is shutting down.
    #[error("Sync engine is shutting down")]
    ShuttingDown,

    /// Operation was cancelled by a scope change or shutdown.
    #[error("Operation cancelled")]
    Cancelled,
}

// =============================================================================
// Error Kind
// =============================================================================

/// Coarse taxonomy used by the lifecycle manager to pick a handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    Network,
    Timeout,
    Server,
    Channel,
    Unsupported,
    Config,
    Protocol,
    Validation,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Server => "server",
            ErrorKind::Channel => "channel",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Config => "config",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Validation => "validation",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<medsync_core::ValidationError> for SyncError {
    fn from(err: medsync_core::ValidationError) -> Self {
        SyncError::Core(CoreError::Validation(err))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            SyncError::DeserializationFailed(err.to_string())
        } else {
            SyncError::SerializationFailed(err.to_string())
        }
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(err.to_string())
        } else if err.is_decode() {
            SyncError::DeserializationFailed(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::ServerError {
                status: status.as_u16(),
                code: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            SyncError::NetworkFailure(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => SyncError::Disconnected,
            WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => SyncError::TlsError(tls.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for SyncError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        SyncError::InvalidSession(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::InvalidConfig(_)
            | SyncError::InvalidUrl(_)
            | SyncError::ConfigLoadFailed(_)
            | SyncError::ConfigSaveFailed(_) => ErrorKind::Config,

            SyncError::AuthUnavailable | SyncError::InvalidSession(_) => ErrorKind::Auth,

            SyncError::NetworkFailure(_)
            | SyncError::ConnectionFailed(_)
            | SyncError::Disconnected
            | SyncError::TlsError(_)
            | SyncError::WebSocketError(_) => ErrorKind::Network,

            SyncError::Timeout(_) => ErrorKind::Timeout,
            SyncError::ServerError { .. } => ErrorKind::Server,
            SyncError::Unsupported { .. } => ErrorKind::Unsupported,
            SyncError::ChannelError { .. } => ErrorKind::Channel,

            SyncError::InvalidMessage(_)
            | SyncError::SerializationFailed(_)
            | SyncError::DeserializationFailed(_) => ErrorKind::Protocol,

            SyncError::Core(_) => ErrorKind::Validation,

            SyncError::Internal(_) | SyncError::ShuttingDown | SyncError::Cancelled => {
                ErrorKind::Internal
            }
        }
    }

    /// Numeric code reported in a failed `ActionResult`.
    pub fn code(&self) -> Option<u16> {
        match self {
            SyncError::ServerError { code, .. } => Some(*code),
            SyncError::Unsupported { .. } => Some(405),
            SyncError::AuthUnavailable | SyncError::InvalidSession(_) => Some(401),
            SyncError::Core(_) => Some(400),
            _ => None,
        }
    }

    /// Returns true if this error is transient and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::ServerError { status, .. } => *status >= 500,
            _ => matches!(self.kind(), ErrorKind::Network | ErrorKind::Timeout),
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        self.kind() == ErrorKind::Config
    }

    /// Returns true if this error indicates a protocol mismatch.
    pub fn is_protocol_error(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::NetworkFailure("reset".into()).is_retryable());
        assert!(SyncError::Disconnected.is_retryable());
        assert!(SyncError::Timeout("10s".into()).is_retryable());
        assert!(SyncError::ServerError {
            status: 503,
            code: 503,
            message: "busy".into()
        }
        .is_retryable());

        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::AuthUnavailable.is_retryable());
        assert!(!SyncError::ServerError {
            status: 403,
            code: 403,
            message: "Forbidden".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_codes() {
        let unsupported = SyncError::Unsupported {
            operation: "fetch_boxes",
            kind: SourceKind::SharedByToken,
        };
        assert_eq!(unsupported.code(), Some(405));
        assert_eq!(unsupported.kind(), ErrorKind::Unsupported);
        assert_eq!(
            unsupported.to_string(),
            "fetch_boxes is not supported for shared_by_token sources"
        );

        let server = SyncError::ServerError {
            status: 400,
            code: 4001,
            message: "Bad box".into(),
        };
        assert_eq!(server.code(), Some(4001));
        assert_eq!(SyncError::Disconnected.code(), None);
    }

    #[test]
    fn test_category_helpers() {
        assert!(SyncError::InvalidUrl("x".into()).is_config_error());
        assert!(SyncError::DeserializationFailed("x".into()).is_protocol_error());
        assert_eq!(SyncError::AuthUnavailable.kind(), ErrorKind::Auth);
    }
}
