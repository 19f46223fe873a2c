//! A receive channel whose socket can be swapped while a read is in progress.
//!
//! The only state shared across threads is the active socket and the
//! cancellation flag, both under one lock that is never held across a
//! blocking call. A blocked [`Connection::receive`] waits on the socket and
//! on an internal wake socket, so [`Connection::signal_unlock`] interrupts it
//! promptly from any thread.

use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use shmpipe_frame::{DepayOutcome, Depayloader};
use shmpipe_transport::{scm, IpcStream, TransportError};
use tracing::{debug, info};

use crate::error::Result;

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Flushing,
    EndOfStream,
}

/// Result of a single [`Connection::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// `len` bytes arrived on the socket installed as `generation`.
    Data { len: usize, generation: u64 },
    /// The read was cancelled by [`Connection::signal_unlock`].
    Flushing,
    /// The peer closed and no replacement socket was supplied.
    EndOfStream,
}

type EosHandler = Arc<dyn Fn(&Connection) + Send + Sync>;

struct Shared {
    socket: Option<Arc<IpcStream>>,
    generation: u64,
    cancelled: bool,
    eos: bool,
}

/// The consumer side of one producer/consumer pairing.
pub struct Connection {
    shared: Mutex<Shared>,
    on_eos: Mutex<Option<EosHandler>>,
    wake_rx: UnixStream,
    wake_tx: UnixStream,
}

impl Connection {
    /// A connection with no socket installed yet.
    pub fn new() -> Result<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair().map_err(TransportError::SocketPair)?;
        wake_rx.set_nonblocking(true).map_err(TransportError::Io)?;
        wake_tx.set_nonblocking(true).map_err(TransportError::Io)?;
        Ok(Self {
            shared: Mutex::new(Shared {
                socket: None,
                generation: 0,
                cancelled: false,
                eos: false,
            }),
            on_eos: Mutex::new(None),
            wake_rx,
            wake_tx,
        })
    }

    /// A connection reading from `socket`.
    pub fn with_socket(socket: IpcStream) -> Result<Self> {
        let connection = Self::new()?;
        connection.set_socket(socket);
        Ok(connection)
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the socket in use. An in-progress receive picks it up on its
    /// next iteration.
    pub fn set_socket(&self, socket: IpcStream) {
        self.install(Some(Arc::new(socket)));
    }

    /// Drop the current socket, leaving the connection disconnected.
    pub fn clear_socket(&self) {
        self.install(None);
    }

    fn install(&self, socket: Option<Arc<IpcStream>>) {
        let generation = {
            let mut shared = self.lock();
            shared.socket = socket;
            shared.generation += 1;
            shared.eos = false;
            shared.generation
        };
        info!(generation, "connection socket replaced");
        self.wake();
    }

    /// The socket currently in use.
    pub fn socket(&self) -> Option<Arc<IpcStream>> {
        self.lock().socket.clone()
    }

    /// Incremented every time the socket is replaced.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn state(&self) -> ConnectionState {
        let shared = self.lock();
        if shared.cancelled {
            ConnectionState::Flushing
        } else if shared.eos {
            ConnectionState::EndOfStream
        } else if shared.socket.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Called (without any lock held) when the peer closes, before
    /// end-of-stream is reported. Installing a different socket from here
    /// makes the receive retry on it transparently.
    pub fn set_eos_handler(&self, handler: impl Fn(&Connection) + Send + Sync + 'static) {
        *self.on_eos.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Make any in-progress or future receive return [`ReceiveOutcome::Flushing`].
    pub fn signal_unlock(&self) {
        self.lock().cancelled = true;
        debug!("connection unlock requested");
        self.wake();
    }

    /// Clear the cancellation flag so receives block normally again.
    pub fn signal_unlock_stop(&self) {
        let mut shared = self.lock();
        shared.cancelled = false;
        self.drain_wake();
        debug!("connection unlock cleared");
    }

    pub fn is_flushing(&self) -> bool {
        self.lock().cancelled
    }

    fn wake(&self) {
        // A full wake socket already has a pending wakeup.
        let _ = (&self.wake_tx).write(&[1]);
    }

    fn drain_wake(&self) {
        let mut sink = [0u8; 64];
        while matches!((&self.wake_rx).read(&mut sink), Ok(n) if n > 0) {}
    }

    /// Block until bytes arrive, the connection is cancelled, or the peer closes.
    ///
    /// Reads at most `buf.len()` bytes; descriptors that arrived with them are
    /// appended to `fds`. Fails with [`TransportError::NotConnected`] when no
    /// socket is installed.
    pub fn receive(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> Result<ReceiveOutcome> {
        loop {
            let (socket, generation) = {
                let shared = self.lock();
                if shared.cancelled {
                    return Ok(ReceiveOutcome::Flushing);
                }
                match &shared.socket {
                    Some(socket) => (Arc::clone(socket), shared.generation),
                    None => return Err(TransportError::NotConnected.into()),
                }
            };
            if buf.is_empty() {
                return Ok(ReceiveOutcome::Data { len: 0, generation });
            }

            let ready = scm::poll_readable(&[socket.as_fd(), self.wake_rx.as_fd()], None)
                .map_err(TransportError::Io)?;
            if ready[1] {
                // Cancellation or a new socket: both are re-checked at the top.
                let cancelled = self.lock().cancelled;
                if !cancelled {
                    self.drain_wake();
                }
                continue;
            }
            if !ready[0] {
                continue;
            }

            match socket.try_recv_with_fds(buf, fds) {
                Ok(0) => {
                    if self.handle_eos(&socket, generation) {
                        continue;
                    }
                    return Ok(ReceiveOutcome::EndOfStream);
                }
                Ok(len) => return Ok(ReceiveOutcome::Data { len, generation }),
                Err(err)
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) =>
                {
                    continue
                }
                Err(err) => return Err(TransportError::Io(err).into()),
            }
        }
    }

    /// Give the end-of-stream handler a chance to supply a new socket.
    ///
    /// Returns `true` if a different socket is now installed.
    fn handle_eos(&self, closed: &Arc<IpcStream>, generation: u64) -> bool {
        info!(generation, "end of stream on connection socket");

        let handler = self
            .on_eos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(self);
        }

        let mut shared = self.lock();
        match &shared.socket {
            Some(current) if !Arc::ptr_eq(current, closed) => {
                info!(generation = shared.generation, "socket replaced after end of stream; retrying");
                true
            }
            _ => {
                shared.socket = None;
                shared.eos = true;
                false
            }
        }
    }

    /// Receive once and feed the bytes to `depay`.
    pub fn depay(&self, depay: &mut Depayloader) -> Result<DepayOutcome> {
        if let Some(frame) = depay.parse()? {
            return Ok(DepayOutcome::Frame(frame));
        }

        let mut chunk = vec![0u8; depay.wanted()];
        let mut fds = Vec::new();
        match self.receive(&mut chunk, &mut fds)? {
            ReceiveOutcome::Flushing => Ok(DepayOutcome::Flushing),
            ReceiveOutcome::EndOfStream => {
                depay.reset();
                Ok(DepayOutcome::EndOfStream)
            }
            ReceiveOutcome::Data { len, generation } => {
                depay.set_stream(generation);
                depay.push(&chunk[..len], fds);
                Ok(match depay.parse()? {
                    Some(frame) => DepayOutcome::Frame(frame),
                    None => DepayOutcome::NeedMoreData,
                })
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.lock();
        f.debug_struct("Connection")
            .field("socket", &shared.socket)
            .field("generation", &shared.generation)
            .field("cancelled", &shared.cancelled)
            .field("eos", &shared.eos)
            .finish()
    }
}
