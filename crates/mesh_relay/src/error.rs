//! Relay error types.

use std::time::Duration;

use crate::endpoint::ChannelRole;

/// Errors reported by a transport implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No channel to the peer exists, or the send to it failed.
    #[error("Destination unreachable: {0}")]
    Unreachable(String),

    /// The transport (or the channel) has been closed.
    #[error("Transport closed")]
    Closed,

    /// A WebSocket-level failure (connect, handshake, send).
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A multipart frame sequence could not be decoded.
    #[error("Frame codec error: {0}")]
    Codec(String),

    /// A request did not complete in time.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the key-persistence store.
#[derive(Debug, thiserror::Error)]
pub enum KeyringError {
    #[error("Keyring I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Keyring serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}

/// Errors surfaced to callers of a relay node.
///
/// Transport-transient failures and malformed protocol traffic are absorbed
/// by the relay itself; only bootstrap failures and fatal reactor
/// configuration errors are expected to reach application code.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The who-are-you handshake did not produce a usable identity.
    #[error("Bootstrap with {endpoint} failed: {reason}")]
    Bootstrap { endpoint: String, reason: String },

    /// An inbound event arrived on a channel role the reactor cannot handle.
    #[error("No handler for inbound channel role {0:?}")]
    UnhandledChannel(ChannelRole),

    /// An address string could not be parsed.
    #[error("Invalid endpoint description: {0}")]
    Endpoint(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Keyring error: {0}")]
    Keyring(#[from] KeyringError),

    /// The node has already been shut down.
    #[error("Node not running")]
    NotRunning,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
