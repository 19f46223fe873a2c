//! Zero-copy video frame transport over Unix sockets and shared memory.
//!
//! A producer writes each frame into an unlinked shared-memory file and
//! hands the consumer a descriptor plus a small header; the pixels are
//! never copied across the process boundary.
//!
//! # Crate Structure
//!
//! - [`transport`] - Unix socket stream with descriptor passing
//! - [`frame`] - Header codec, arena allocator, payloader and depayloader
//! - [`peer`] - Connections, fan-out sink and the attach handshake (behind `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use shmpipe_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use shmpipe_frame::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use shmpipe_peer::*;
}
