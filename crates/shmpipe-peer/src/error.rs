use std::time::Duration;

/// Errors that can occur in peer operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] shmpipe_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] shmpipe_frame::FrameError),

    /// The producer's format did not become known in time.
    #[error("no capabilities available after {0:?}")]
    HandshakeTimeout(Duration),

    /// The attach handshake could not complete.
    #[error("attach failed: {0}")]
    HandshakeFailed(String),

    /// The attach endpoint did not answer in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PeerError {
    /// Whether only the current frame was lost and the connection is still usable.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, PeerError::Frame(err) if err.is_frame_local())
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
