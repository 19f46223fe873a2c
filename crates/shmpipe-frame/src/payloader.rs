use std::io::ErrorKind;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use bytes::Bytes;
use shmpipe_transport::{SendFds, TransportError};
use tracing::{debug, trace};

use crate::arena::ArenaAllocator;
use crate::buffer::{Memory, VideoBuffer};
use crate::clock::{ClockConfig, PipelineClock, SlavedClock};
use crate::codec::FrameHeader;
use crate::error::{FrameError, Result};
use crate::fault::{FaultHook, FaultInjectionPoint, FRAME_SEND};

/// Default cap on inline payloads: 16 MiB.
pub const DEFAULT_MAX_INLINE_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Payloader configuration.
#[derive(Debug, Clone)]
pub struct PayloaderConfig {
    /// Heap buffers up to this many bytes are sent inline instead of being
    /// copied into an arena region. Default: 0 (only empty buffers).
    pub inline_threshold: u64,
    /// Largest inline payload the payloader will produce. Default: 16 MiB.
    pub max_inline_payload: u64,
    pub clock: ClockConfig,
}

impl Default for PayloaderConfig {
    fn default() -> Self {
        Self {
            inline_threshold: 0,
            max_inline_payload: DEFAULT_MAX_INLINE_PAYLOAD,
            clock: ClockConfig::default(),
        }
    }
}

/// Frame body as it goes on the wire.
#[derive(Debug)]
pub enum Payload {
    /// A descriptor owned by the frame, attached to the header.
    Fd(OwnedFd),
    /// Bytes written straight after the header.
    Inline(Bytes),
}

/// A frame ready to be written: header plus the payload it describes.
#[derive(Debug)]
pub struct PayloadedFrame {
    pub header: FrameHeader,
    pub payload: Payload,
}

impl PayloadedFrame {
    fn fds(&self) -> Vec<BorrowedFd<'_>> {
        match &self.payload {
            Payload::Fd(fd) => vec![fd.as_fd()],
            Payload::Inline(_) => Vec::new(),
        }
    }
}

/// Result of a frame write that is allowed to give up before starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The socket had no room for the first byte; nothing was sent.
    WouldBlock,
}

/// Turns buffers into wire frames and writes them.
pub struct Payloader {
    allocator: Arc<ArenaAllocator>,
    clock: SlavedClock,
    base_time: u64,
    config: PayloaderConfig,
    fault: Arc<dyn FaultHook>,
    frames_sent: u64,
}

impl Payloader {
    /// Create a payloader with its own arena and the `frame_send` checkpoint
    /// read from the environment.
    pub fn new(config: PayloaderConfig) -> Self {
        Self {
            allocator: Arc::new(ArenaAllocator::default()),
            clock: SlavedClock::new(config.clock.clone()),
            base_time: 0,
            fault: Arc::new(FaultInjectionPoint::from_env(FRAME_SEND)),
            frames_sent: 0,
            config,
        }
    }

    /// Share an existing arena.
    pub fn with_allocator(mut self, allocator: Arc<ArenaAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Replace the `frame_send` checkpoint.
    pub fn with_fault_hook(mut self, fault: Arc<dyn FaultHook>) -> Self {
        self.fault = fault;
        self
    }

    /// Replace the slaved clock (tests use a manual internal clock).
    pub fn with_clock(mut self, clock: SlavedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Slave the internal clock to the pipeline clock, or detach with `None`.
    pub fn set_clock(&mut self, master: Option<Arc<dyn PipelineClock>>) {
        self.clock.set_master(master);
    }

    /// Pipeline time at which running time was zero.
    pub fn set_base_time(&mut self, base_time: u64) {
        self.base_time = base_time;
    }

    pub fn allocator(&self) -> &Arc<ArenaAllocator> {
        &self.allocator
    }

    pub fn clock(&self) -> &SlavedClock {
        &self.clock
    }

    pub fn config(&self) -> &PayloaderConfig {
        &self.config
    }

    /// Frames fully handed to the kernel so far.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Count a frame as sent. Call only after every byte and the descriptor
    /// were accepted by at least one socket.
    pub fn record_sent(&mut self) {
        self.frames_sent += 1;
    }

    /// Run the `frame_send` checkpoint. An injected fault looks like a send failure.
    pub fn checkpoint(&self) -> Result<()> {
        self.fault
            .check()
            .map_err(|fault| FrameError::Transport(TransportError::Io(fault.into())))
    }

    /// Sender-side capture timestamp for a buffer, `0` if it has no pts.
    pub fn capture_timestamp(&self, buffer: &VideoBuffer) -> u64 {
        match buffer.pts() {
            Some(pts) => self.clock.unadjust(self.base_time.saturating_add(pts)),
            None => 0,
        }
    }

    /// Build the wire frame for `buffer`.
    ///
    /// Descriptor-backed buffers are shared as-is through a duplicated
    /// descriptor. Heap buffers are copied into a fresh arena region, or sent
    /// inline when no larger than `inline_threshold`.
    pub fn pay(&mut self, buffer: &VideoBuffer) -> Result<PayloadedFrame> {
        self.clock.sync();
        let capture_timestamp = self.capture_timestamp(buffer);

        let frame = match buffer.memory() {
            Memory::Region(region) => {
                let fd = region
                    .as_fd()
                    .try_clone_to_owned()
                    .map_err(TransportError::FdAttach)?;
                trace!(size = region.size(), "zero-copy payload");
                PayloadedFrame {
                    header: FrameHeader::referenced(
                        capture_timestamp,
                        region.offset(),
                        region.size(),
                    ),
                    payload: Payload::Fd(fd),
                }
            }
            Memory::Heap(bytes) if (bytes.len() as u64) <= self.config.inline_threshold => {
                let size = bytes.len() as u64;
                if size > self.config.max_inline_payload {
                    return Err(FrameError::PayloadTooLarge {
                        size,
                        max: self.config.max_inline_payload,
                    });
                }
                PayloadedFrame {
                    header: FrameHeader::inline(capture_timestamp, size),
                    payload: Payload::Inline(bytes.clone()),
                }
            }
            Memory::Heap(bytes) => {
                let region = self.allocator.copy_allocate(bytes)?.into_fd_region();
                trace!(size = region.size(), "copied payload into arena");
                PayloadedFrame {
                    header: FrameHeader::referenced(
                        capture_timestamp,
                        region.offset(),
                        region.size(),
                    ),
                    payload: Payload::Fd(region.into_fd()),
                }
            }
        };
        Ok(frame)
    }

    /// Checkpoint, payload and write one buffer to `socket`.
    ///
    /// The frame's descriptor is closed when this returns, sent or not.
    pub fn send_frame<W: SendFds + ?Sized>(
        &mut self,
        socket: &W,
        buffer: &VideoBuffer,
    ) -> Result<()> {
        self.checkpoint()?;
        let frame = self.pay(buffer)?;
        write_frame(socket, &frame)?;
        self.record_sent();
        debug!(
            size = frame.header.payload_size,
            capture_timestamp = frame.header.capture_timestamp,
            frames_sent = self.frames_sent,
            "sent frame"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Payloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payloader")
            .field("base_time", &self.base_time)
            .field("config", &self.config)
            .field("fault", &self.fault.name())
            .field("frames_sent", &self.frames_sent)
            .finish()
    }
}

/// Write `frame` to `socket`, blocking until all of it is accepted.
pub fn write_frame<W: SendFds + ?Sized>(socket: &W, frame: &PayloadedFrame) -> Result<()> {
    write_frame_inner(socket, frame, false).map(|_| ())
}

/// Like [`write_frame`], but returns [`WriteOutcome::WouldBlock`] without
/// sending anything if the socket is full. Once the first byte is out the
/// rest of the frame is written blocking, so a frame is never left half-sent.
pub fn try_write_frame<W: SendFds + ?Sized>(
    socket: &W,
    frame: &PayloadedFrame,
) -> Result<WriteOutcome> {
    write_frame_inner(socket, frame, true)
}

fn write_frame_inner<W: SendFds + ?Sized>(
    socket: &W,
    frame: &PayloadedFrame,
    nonblocking: bool,
) -> Result<WriteOutcome> {
    let header = frame.header.to_bytes();
    let fds = frame.fds();

    // Descriptors ride on the first byte of this call.
    let first = loop {
        let sent = if nonblocking {
            socket.try_send_with_fds(&header, &fds)
        } else {
            socket.send_with_fds(&header, &fds)
        };
        match sent {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => break n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if nonblocking && err.kind() == ErrorKind::WouldBlock => {
                return Ok(WriteOutcome::WouldBlock)
            }
            Err(err) if fds.is_empty() => return Err(TransportError::Io(err).into()),
            Err(err) => return Err(TransportError::FdAttach(err).into()),
        }
    };

    send_all(socket, &header[first..])?;
    if let Payload::Inline(bytes) = &frame.payload {
        send_all(socket, bytes)?;
    }
    Ok(WriteOutcome::Written)
}

fn send_all<W: SendFds + ?Sized>(socket: &W, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        match socket.send_with_fds(data, &[]) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => data = &data[n..],
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransportError::Io(err).into()),
        }
    }
    Ok(())
}
