//! Zero-copy video frame transport over Unix sockets.
//!
//! This is the core layer of shmpipe. Every frame on the wire is:
//! - A 24-byte native-endian header (capture timestamp, payload offset,
//!   payload size)
//! - Either one attached descriptor referencing the payload inside a shared
//!   memory file, or the payload bytes inline after the header
//!
//! Payload memory comes from an arena of anonymous, unlinked files so it can
//! cross process boundaries without copying pixel data.

pub mod arena;
pub mod buffer;
pub mod clock;
pub mod codec;
pub mod depayloader;
pub mod error;
pub mod fault;
pub mod payloader;

pub use arena::{AllocationParams, ArenaAllocator, ArenaConfig, ArenaRegion};
pub use buffer::{FdRegion, Memory, RegionMap, VideoBuffer};
pub use clock::{
    monotonic_now, Calibration, ClockConfig, ManualClock, MonotonicClock, PipelineClock,
    SlavedClock,
};
pub use codec::{decode_header, encode_header, FrameHeader, HEADER_SIZE, INLINE_OFFSET};
pub use depayloader::{DepayOutcome, Depayloader, DepayloaderConfig, Frame};
pub use error::{FrameError, Result};
pub use fault::{FaultHook, FaultInjectionPoint, InjectedFault, ATTACH_PRE_RETURN, FRAME_SEND};
pub use payloader::{
    try_write_frame, write_frame, Payload, PayloadedFrame, Payloader, PayloaderConfig,
    WriteOutcome, DEFAULT_MAX_INLINE_PAYLOAD,
};
