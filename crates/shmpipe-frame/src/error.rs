use shmpipe_transport::TransportError;

/// Errors that can occur while payloading or depayloading frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The arena could not create or size backing storage for a frame.
    #[error("failed to allocate {size} byte region: {source}")]
    AllocationFailed {
        size: usize,
        source: std::io::Error,
    },

    /// A received frame was malformed; the connection itself is still usable.
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    /// An inline payload exceeds the configured maximum.
    #[error("inline payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    /// Sending or receiving on the socket failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The peer closed the connection part-way through a frame.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// Whether the error only affects the current frame.
    ///
    /// Allocation failures and corrupt frames leave the connection in sync;
    /// everything else means the stream can no longer be trusted.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            FrameError::AllocationFailed { .. } | FrameError::CorruptFrame(_)
        )
    }
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Transport(TransportError::Io(err))
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
