//! Common error types for Vantage.

use thiserror::Error;

/// Result type alias using Vantage's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Vantage operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire codec error (protobuf encode/decode, size bounds)
    #[error("codec error: {0}")]
    Codec(String),

    /// Signaling transport or envelope error
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Media pipeline error (element creation, linking, state changes)
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// OpenXR runtime error
    #[error("xr error: {0}")]
    Xr(String),

    /// EGL / GL error
    #[error("gl error: {0}")]
    Gl(String),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Peer is gone or was never registered
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
}

impl Error {
    /// Create a codec error from any displayable type.
    pub fn codec(msg: impl std::fmt::Display) -> Self {
        Self::Codec(msg.to_string())
    }

    /// Create a signaling error from any displayable type.
    pub fn signaling(msg: impl std::fmt::Display) -> Self {
        Self::Signaling(msg.to_string())
    }

    /// Create a pipeline error from any displayable type.
    pub fn pipeline(msg: impl std::fmt::Display) -> Self {
        Self::Pipeline(msg.to_string())
    }

    /// Create an xr error from any displayable type.
    pub fn xr(msg: impl std::fmt::Display) -> Self {
        Self::Xr(msg.to_string())
    }

    /// Create a gl error from any displayable type.
    pub fn gl(msg: impl std::fmt::Display) -> Self {
        Self::Gl(msg.to_string())
    }

    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }
}
