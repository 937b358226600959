//! Common error types for Deskcall.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using Deskcall's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Deskcall operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Signaling transport failed or is unavailable
    #[error("transport error: {0}")]
    Transport(String),

    /// Camera/microphone could not be acquired (permission denied or no device)
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    /// Offer/answer exchange did not complete in time
    #[error("negotiation timed out after {0:?}")]
    NegotiationTimeout(Duration),

    /// ICE never reached a connected state in time
    #[error("connectivity timed out after {0:?}")]
    ConnectivityTimeout(Duration),

    /// Socket disconnect mid-call
    #[error("transport lost: {0}")]
    TransportLost(String),

    /// A second concurrent call attempt on the same client
    #[error("a call is already active on this client")]
    CallAlreadyActive,

    /// Signaling for an ended or unknown session
    #[error("stale signaling message: {0}")]
    StaleMessage(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create a media-unavailable error from any displayable type.
    pub fn media_unavailable(msg: impl std::fmt::Display) -> Self {
        Self::MediaUnavailable(msg.to_string())
    }

    /// Create a stale-message error from any displayable type.
    pub fn stale(msg: impl std::fmt::Display) -> Self {
        Self::StaleMessage(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
