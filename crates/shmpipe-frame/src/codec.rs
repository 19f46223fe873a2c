use bytes::{BufMut, BytesMut};

/// Frame header: capture timestamp (8) + payload offset (8) + payload size (8).
pub const HEADER_SIZE: usize = 24;

/// `payload_offset` value marking a payload that follows the header inline.
pub const INLINE_OFFSET: u64 = u64::MAX;

/// Metadata sent ahead of every frame.
///
/// Wire format (native byte order, no magic or version field):
/// ```text
/// ┌────────────────────┬────────────────────┬────────────────────┐
/// │ capture_timestamp  │ payload_offset     │ payload_size       │
/// │ (8B, ns, 0=unknown)│ (8B, MAX = inline) │ (8B)               │
/// └────────────────────┴────────────────────┴────────────────────┘
/// ```
/// A referenced frame carries exactly one descriptor attached to the first
/// header byte. An inline frame is followed by `payload_size` payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Sender's monotonic clock at capture, in nanoseconds. `0` means unknown.
    pub capture_timestamp: u64,
    /// Start of the payload inside the transferred file, or [`INLINE_OFFSET`].
    pub payload_offset: u64,
    /// Payload length in bytes.
    pub payload_size: u64,
}

impl FrameHeader {
    /// Header for a payload living in `[offset, offset + size)` of a transferred file.
    pub fn referenced(capture_timestamp: u64, offset: u64, size: u64) -> Self {
        Self {
            capture_timestamp,
            payload_offset: offset,
            payload_size: size,
        }
    }

    /// Header for `size` payload bytes that follow inline.
    pub fn inline(capture_timestamp: u64, size: u64) -> Self {
        Self {
            capture_timestamp,
            payload_offset: INLINE_OFFSET,
            payload_size: size,
        }
    }

    pub fn is_inline(&self) -> bool {
        self.payload_offset == INLINE_OFFSET
    }

    /// One past the last referenced byte, or `None` if it overflows.
    pub fn payload_end(&self) -> Option<u64> {
        self.payload_offset.checked_add(self.payload_size)
    }

    /// Encode into the fixed-size wire representation.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..8].copy_from_slice(&self.capture_timestamp.to_ne_bytes());
        out[8..16].copy_from_slice(&self.payload_offset.to_ne_bytes());
        out[16..24].copy_from_slice(&self.payload_size.to_ne_bytes());
        out
    }
}

/// Append the wire form of `header` to `dst`.
pub fn encode_header(header: &FrameHeader, dst: &mut BytesMut) {
    dst.reserve(HEADER_SIZE);
    dst.put_slice(&header.to_bytes());
}

/// Decode a header from the front of `src`.
///
/// Returns `None` if fewer than [`HEADER_SIZE`] bytes are available; the
/// caller should retry once more bytes have arrived. Does not consume input.
pub fn decode_header(src: &[u8]) -> Option<FrameHeader> {
    let raw: &[u8; HEADER_SIZE] = src.get(..HEADER_SIZE)?.try_into().ok()?;
    let field = |at: usize| {
        let mut word = [0u8; 8];
        word.copy_from_slice(&raw[at..at + 8]);
        u64::from_ne_bytes(word)
    };
    Some(FrameHeader {
        capture_timestamp: field(0),
        payload_offset: field(8),
        payload_size: field(16),
    })
}
