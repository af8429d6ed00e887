//! Error types for the chat server and client connection
//!
//! Decode problems never show up here: a malformed line becomes a `system`
//! message. Unknown message types are routed, not rejected.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Server-side errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind the listening socket (fatal at startup)
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// IO error on the listener or a connection
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Client connection errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport could not be established
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Operation requires the `Connected` state
    #[error("Not connected to server")]
    NotConnected,

    /// `connect` called while a connection is live or being established
    #[error("Already connected or connecting")]
    AlreadyConnected,

    /// `disconnect` ran while the connect attempt was in flight
    #[error("Connection attempt cancelled")]
    Cancelled,

    /// Write failure on an established transport
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Message send errors
///
/// Occurs when a session's outbound channel has been closed because its
/// writer task ended.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}
