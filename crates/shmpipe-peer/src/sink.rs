use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use shmpipe_frame::{try_write_frame, Payloader, VideoBuffer, WriteOutcome};
use shmpipe_transport::IpcStream;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Identifies a client registered with a [`SocketSink`].
pub type ClientId = u64;

/// Socket sink configuration.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Bound on finishing a frame once its first byte reached a client.
    /// A client that stalls longer is dropped. Default: 1 second.
    pub write_timeout: Option<Duration>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            write_timeout: Some(Duration::from_secs(1)),
        }
    }
}

/// What happened to one rendered frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    /// Clients that received the whole frame.
    pub delivered: usize,
    /// Clients whose socket was full, so the frame was skipped for them.
    pub skipped: usize,
    /// Clients removed because the write failed.
    pub dropped: usize,
}

struct Client {
    id: ClientId,
    socket: Arc<IpcStream>,
}

/// Sends every frame to all attached consumers.
///
/// Each buffer is payloaded once; every client receives the same header
/// and its own duplicate of the payload descriptor.
pub struct SocketSink {
    clients: Mutex<Vec<Client>>,
    payloader: Mutex<Payloader>,
    next_id: AtomicU64,
    config: SinkConfig,
}

impl SocketSink {
    pub fn new(payloader: Payloader, config: SinkConfig) -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            payloader: Mutex::new(payloader),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    fn clients(&self) -> MutexGuard<'_, Vec<Client>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a consumer socket. Frames rendered from now on reach it.
    pub fn add(&self, socket: IpcStream) -> Result<ClientId> {
        socket.set_write_timeout(self.config.write_timeout)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut clients = self.clients();
        clients.push(Client {
            id,
            socket: Arc::new(socket),
        });
        info!(client = id, clients = clients.len(), "client added");
        Ok(id)
    }

    /// Unregister and close a consumer socket. Returns `false` if `id` was
    /// not registered.
    pub fn remove(&self, id: ClientId) -> bool {
        let mut clients = self.clients();
        let before = clients.len();
        clients.retain(|client| client.id != id);
        let removed = clients.len() != before;
        if removed {
            info!(client = id, clients = clients.len(), "client removed");
        }
        removed
    }

    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    /// Run `f` with exclusive access to the payloader (clock, base time).
    pub fn with_payloader<R>(&self, f: impl FnOnce(&mut Payloader) -> R) -> R {
        let mut payloader = self.payloader.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut payloader)
    }

    /// Payload `buffer` once and write it to every client.
    ///
    /// The client list lock is not held while writing.
    pub fn render(&self, buffer: &VideoBuffer) -> Result<RenderStats> {
        let targets: Vec<(ClientId, Arc<IpcStream>)> = self
            .clients()
            .iter()
            .map(|client| (client.id, Arc::clone(&client.socket)))
            .collect();
        if targets.is_empty() {
            return Ok(RenderStats::default());
        }

        let mut payloader = self.payloader.lock().unwrap_or_else(PoisonError::into_inner);
        payloader.checkpoint()?;
        let frame = payloader.pay(buffer)?;

        let mut stats = RenderStats::default();
        let mut failed = Vec::new();
        for (id, socket) in &targets {
            match try_write_frame(socket.as_ref(), &frame) {
                Ok(WriteOutcome::Written) => stats.delivered += 1,
                Ok(WriteOutcome::WouldBlock) => {
                    debug!(client = id, "client busy; frame skipped");
                    stats.skipped += 1;
                }
                Err(err) => {
                    warn!(client = id, error = %err, "write failed; dropping client");
                    failed.push(*id);
                }
            }
        }

        if stats.delivered > 0 {
            payloader.record_sent();
        }
        drop(payloader);

        for id in failed {
            if self.remove(id) {
                stats.dropped += 1;
            }
        }
        debug!(
            size = frame.header.payload_size,
            delivered = stats.delivered,
            skipped = stats.skipped,
            dropped = stats.dropped,
            "rendered frame"
        );
        Ok(stats)
    }
}

impl std::fmt::Debug for SocketSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketSink")
            .field("clients", &self.client_count())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Arc;

    use shmpipe_frame::{
        Depayloader, FaultInjectionPoint, PayloaderConfig, FRAME_SEND, HEADER_SIZE,
    };

    use super::*;

    fn sink() -> SocketSink {
        let payloader = Payloader::new(PayloaderConfig::default())
            .with_fault_hook(Arc::new(FaultInjectionPoint::disabled(FRAME_SEND)));
        SocketSink::new(payloader, SinkConfig::default())
    }

    #[test]
    fn render_without_clients_is_noop() {
        let sink = sink();
        let stats = sink
            .render(&VideoBuffer::from_bytes(&b"frame"[..]))
            .expect("render should succeed");
        assert_eq!(stats, RenderStats::default());
        assert_eq!(sink.with_payloader(|p| p.frames_sent()), 0);
    }

    #[test]
    fn every_client_receives_the_frame() {
        let sink = sink();
        let (ours_a, theirs_a) = IpcStream::pair().expect("pair");
        let (ours_b, theirs_b) = IpcStream::pair().expect("pair");
        sink.add(ours_a).expect("add a");
        sink.add(ours_b).expect("add b");

        let stats = sink
            .render(&VideoBuffer::from_bytes(&b"hello"[..]))
            .expect("render should succeed");
        assert_eq!(stats.delivered, 2);
        assert_eq!(sink.with_payloader(|p| p.frames_sent()), 1);

        for theirs in [theirs_a, theirs_b] {
            let mut depay = Depayloader::default();
            let frame = loop {
                match depay.depay(&theirs).expect("depay") {
                    shmpipe_frame::DepayOutcome::Frame(frame) => break frame,
                    shmpipe_frame::DepayOutcome::NeedMoreData => continue,
                    other => panic!("unexpected outcome: {other:?}"),
                }
            };
            assert_eq!(&frame.buffer.to_bytes().expect("bytes")[..], b"hello");
        }
    }

    #[test]
    fn closed_client_is_dropped() {
        let sink = sink();
        let (ours_a, theirs_a) = IpcStream::pair().expect("pair");
        let (ours_b, mut theirs_b) = IpcStream::pair().expect("pair");
        sink.add(ours_a).expect("add a");
        sink.add(ours_b).expect("add b");
        drop(theirs_a);

        let stats = sink
            .render(&VideoBuffer::from_bytes(&b"x"[..]))
            .expect("render should succeed");
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(sink.client_count(), 1);

        let mut header = [0u8; HEADER_SIZE];
        theirs_b.read_exact(&mut header).expect("header");
    }

    #[test]
    fn full_client_skips_frame() {
        let sink = sink();
        let (ours, _theirs) = IpcStream::pair().expect("pair");
        let filler = ours.try_clone().expect("clone");
        sink.add(ours).expect("add");

        let chunk = [0u8; 4096];
        while filler.try_send_with_fds(&chunk, &[]).is_ok() {}

        let stats = sink
            .render(&VideoBuffer::from_bytes(&b"late"[..]))
            .expect("render should succeed");
        assert_eq!(stats.skipped, 1);
        assert_eq!(sink.client_count(), 1);
        assert_eq!(sink.with_payloader(|p| p.frames_sent()), 0);
    }

    #[test]
    fn remove_unknown_client_returns_false() {
        let sink = sink();
        let (ours, _theirs) = IpcStream::pair().expect("pair");
        let id = sink.add(ours).expect("add");
        assert!(!sink.remove(id + 100));
        assert!(sink.remove(id));
        assert_eq!(sink.client_count(), 0);
    }

    #[test]
    fn injected_send_fault_fails_render() {
        let payloader = Payloader::new(PayloaderConfig::default())
            .with_fault_hook(Arc::new(FaultInjectionPoint::with_commands(FRAME_SEND, "error")));
        let sink = SocketSink::new(payloader, SinkConfig::default());
        let (ours, _theirs) = IpcStream::pair().expect("pair");
        sink.add(ours).expect("add");

        assert!(sink.render(&VideoBuffer::from_bytes(&b"x"[..])).is_err());
        assert!(sink.render(&VideoBuffer::from_bytes(&b"x"[..])).is_ok());
    }
}
