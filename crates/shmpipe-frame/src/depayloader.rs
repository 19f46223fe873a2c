use std::io::ErrorKind;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use shmpipe_transport::{RecvFds, TransportError};
use tracing::{debug, info, warn};

use crate::buffer::{file_size, FdRegion, VideoBuffer};
use crate::clock::{ClockConfig, PipelineClock, SlavedClock};
use crate::codec::{decode_header, FrameHeader, HEADER_SIZE};
use crate::error::{FrameError, Result};
use crate::payloader::DEFAULT_MAX_INLINE_PAYLOAD;

const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Depayloader configuration.
#[derive(Debug, Clone)]
pub struct DepayloaderConfig {
    /// Largest inline payload accepted. Larger ones are fatal to the stream.
    /// Default: 16 MiB.
    pub max_inline_payload: u64,
    pub clock: ClockConfig,
}

impl Default for DepayloaderConfig {
    fn default() -> Self {
        Self {
            max_inline_payload: DEFAULT_MAX_INLINE_PAYLOAD,
            clock: ClockConfig::default(),
        }
    }
}

/// A reconstructed frame.
#[derive(Debug)]
pub struct Frame {
    /// The header as received.
    pub header: FrameHeader,
    /// Payload (read-only region or inline bytes) with the receiver-side pts.
    pub buffer: VideoBuffer,
}

/// What a single depay step produced.
#[derive(Debug)]
pub enum DepayOutcome {
    Frame(Frame),
    /// A partial frame is buffered; call again once more bytes can arrive.
    NeedMoreData,
    /// The peer closed the connection.
    EndOfStream,
    /// A blocking receive was interrupted by cancellation.
    Flushing,
}

/// Rebuilds frames from the byte stream and the descriptors that came with it.
///
/// Bytes are fed in with [`push`](Self::push) in chunks no larger than
/// [`wanted`](Self::wanted), which keeps every received descriptor paired
/// with the header it was attached to.
pub struct Depayloader {
    buf: BytesMut,
    fds: Vec<OwnedFd>,
    clock: SlavedClock,
    base_time: Option<u64>,
    config: DepayloaderConfig,
    scratch: Vec<u8>,
    stream: Option<u64>,
    clamped: u64,
}

impl Depayloader {
    pub fn new(config: DepayloaderConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            fds: Vec::new(),
            clock: SlavedClock::new(config.clock.clone()),
            base_time: None,
            config,
            scratch: Vec::new(),
            stream: None,
            clamped: 0,
        }
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

    /// Pipeline time at which running time was zero, once known.
    pub fn set_base_time(&mut self, base_time: Option<u64>) {
        self.base_time = base_time;
    }

    pub fn clock(&self) -> &SlavedClock {
        &self.clock
    }

    pub fn config(&self) -> &DepayloaderConfig {
        &self.config
    }

    /// Frames whose capture time fell before the base time.
    pub fn clamped_timestamps(&self) -> u64 {
        self.clamped
    }

    /// Bytes of the current frame not yet received, capped at one read chunk.
    pub fn wanted(&self) -> usize {
        let Some(header) = decode_header(&self.buf) else {
            return HEADER_SIZE - self.buf.len();
        };
        if !header.is_inline() {
            return 0;
        }
        let total = (HEADER_SIZE as u64).saturating_add(header.payload_size);
        let missing = total.saturating_sub(self.buf.len() as u64);
        missing.min(READ_CHUNK_SIZE as u64) as usize
    }

    /// Whether part of a frame is buffered.
    pub fn has_partial_frame(&self) -> bool {
        !self.buf.is_empty() || !self.fds.is_empty()
    }

    /// Feed received bytes and the descriptors that arrived with them.
    pub fn push(&mut self, bytes: &[u8], fds: Vec<OwnedFd>) {
        self.buf.extend_from_slice(bytes);
        self.fds.extend(fds);
    }

    /// Note which socket the next bytes come from.
    ///
    /// Bytes from a replacement socket never complete a frame started on the
    /// previous one: switching drops the partial frame.
    pub fn set_stream(&mut self, stream: u64) {
        if self.stream.is_some_and(|current| current != stream) {
            self.reset();
        }
        self.stream = Some(stream);
    }

    /// Drop any partial frame, closing buffered descriptors.
    pub fn reset(&mut self) {
        if self.has_partial_frame() {
            debug!(
                bytes = self.buf.len(),
                fds = self.fds.len(),
                "discarding partial frame"
            );
        }
        self.buf.clear();
        self.fds.clear();
    }

    /// Try to complete a frame from what has been pushed so far.
    ///
    /// `Ok(None)` means more bytes are needed. A `CorruptFrame` error
    /// consumes the bad frame, so the next call starts on a fresh header.
    pub fn parse(&mut self) -> Result<Option<Frame>> {
        let Some(header) = decode_header(&self.buf) else {
            return Ok(None);
        };

        let mut buffer = if header.is_inline() {
            if header.payload_size > self.config.max_inline_payload {
                return Err(FrameError::PayloadTooLarge {
                    size: header.payload_size,
                    max: self.config.max_inline_payload,
                });
            }
            let size = header.payload_size as usize;
            if self.buf.len() < HEADER_SIZE + size {
                return Ok(None);
            }
            self.buf.advance(HEADER_SIZE);
            let payload = self.buf.split_to(size).freeze();

            let stray = std::mem::take(&mut self.fds);
            if !stray.is_empty() {
                warn!(fds = stray.len(), "inline frame arrived with descriptors");
                return Err(FrameError::CorruptFrame(format!(
                    "inline frame carried {} descriptor(s)",
                    stray.len()
                )));
            }
            VideoBuffer::from_bytes(payload)
        } else {
            self.buf.advance(HEADER_SIZE);
            let trailing = self.buf.len();
            self.buf.clear();
            let mut fds = std::mem::take(&mut self.fds);
            if trailing != 0 {
                warn!(trailing, "unexpected bytes after referenced frame header");
                return Err(FrameError::CorruptFrame(format!(
                    "{trailing} unexpected byte(s) after header"
                )));
            }
            let region = validate_region(&header, &mut fds)?;
            VideoBuffer::from_region(region)
        };

        buffer.set_pts(self.running_time(header.capture_timestamp));
        debug!(
            size = header.payload_size,
            capture_timestamp = header.capture_timestamp,
            pts = ?buffer.pts(),
            "depayloaded frame"
        );
        Ok(Some(Frame { header, buffer }))
    }

    /// Receive once from `socket` and try to complete a frame.
    pub fn depay<S: RecvFds + ?Sized>(&mut self, socket: &S) -> Result<DepayOutcome> {
        if let Some(frame) = self.parse()? {
            return Ok(DepayOutcome::Frame(frame));
        }

        let wanted = self.wanted();
        self.scratch.resize(wanted, 0);
        let mut fds = Vec::new();
        let n = loop {
            match socket.recv_with_fds(&mut self.scratch, &mut fds) {
                Ok(n) => break n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Io(err).into()),
            }
        };

        if n == 0 {
            self.reset();
            return Ok(DepayOutcome::EndOfStream);
        }

        let chunk = std::mem::take(&mut self.scratch);
        self.push(&chunk[..n], fds);
        self.scratch = chunk;

        Ok(match self.parse()? {
            Some(frame) => DepayOutcome::Frame(frame),
            None => DepayOutcome::NeedMoreData,
        })
    }

    /// Translate a sender capture timestamp into running time.
    fn running_time(&mut self, capture_timestamp: u64) -> Option<u64> {
        if capture_timestamp == 0 {
            return None;
        }
        self.clock.sync();
        let pipeline_time = self.clock.adjust(capture_timestamp);

        let Some(base_time) = self.base_time else {
            info!(pipeline_time, "no base time yet; using running time 0");
            return Some(0);
        };
        match pipeline_time.checked_sub(base_time) {
            Some(running_time) => Some(running_time),
            None => {
                self.clamped += 1;
                warn!(base_time, pipeline_time, "capture predates base time; clamping to 0");
                Some(0)
            }
        }
    }
}

/// Check the descriptor count and backing file size of a referenced frame.
///
/// This is a sanity check, not a security boundary: whoever sends a
/// descriptor can already write anything into it.
fn validate_region(header: &FrameHeader, fds: &mut Vec<OwnedFd>) -> Result<FdRegion> {
    if fds.len() != 1 {
        warn!(fds = fds.len(), "referenced frame needs exactly one descriptor");
        return Err(FrameError::CorruptFrame(format!(
            "expected 1 descriptor, received {}",
            fds.len()
        )));
    }
    let Some(fd) = fds.pop() else {
        return Err(FrameError::CorruptFrame("missing descriptor".to_string()));
    };

    let end = header.payload_end().ok_or_else(|| {
        FrameError::CorruptFrame("payload range overflows".to_string())
    })?;
    let actual = file_size(fd.as_fd())
        .map_err(|e| FrameError::CorruptFrame(format!("fstat on received descriptor: {e}")))?;
    if actual < end {
        warn!(
            file_size = actual,
            offset = header.payload_offset,
            size = header.payload_size,
            "received descriptor too small for payload"
        );
        return Err(FrameError::CorruptFrame(format!(
            "backing file is {actual} bytes, payload needs {end}"
        )));
    }

    Ok(FdRegion::new_readonly(
        fd,
        header.payload_offset,
        header.payload_size,
    ))
}

impl Default for Depayloader {
    fn default() -> Self {
        Self::new(DepayloaderConfig::default())
    }
}

impl std::fmt::Debug for Depayloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Depayloader")
            .field("buffered", &self.buf.len())
            .field("fds", &self.fds.len())
            .field("base_time", &self.base_time)
            .field("config", &self.config)
            .finish()
    }
}
