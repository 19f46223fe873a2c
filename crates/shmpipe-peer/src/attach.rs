use std::sync::Arc;
use std::time::Duration;

use shmpipe_frame::{FaultHook, FaultInjectionPoint, ATTACH_PRE_RETURN};
use shmpipe_transport::IpcStream;
use tracing::{info, warn};

use crate::caps::CapsSlot;
use crate::error::{PeerError, Result};
use crate::sink::{ClientId, SocketSink};

/// Configuration for the producer side of the attach handshake.
#[derive(Debug, Clone)]
pub struct AttachConfig {
    /// How long an attach waits for the output format to become known.
    pub caps_timeout: Duration,
    /// Poll interval while waiting for the format.
    pub caps_poll_interval: Duration,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            caps_timeout: Duration::from_secs(20),
            caps_poll_interval: Duration::from_millis(10),
        }
    }
}

/// A successful attach: the consumer's end of a fresh socket pair plus the
/// producer's current capability string.
///
/// A reply from [`Producer::attach`] keeps the producer-side client
/// registered only once [`commit`](Self::commit) is called. Dropping it
/// uncommitted removes the client from the sink again.
#[derive(Debug)]
pub struct AttachReply {
    pub socket: IpcStream,
    /// Index of the socket in the reply's descriptor list.
    pub handle: u32,
    pub caps: String,
    pub(crate) registration: Option<Registration>,
}

impl AttachReply {
    pub fn new(socket: IpcStream, caps: String) -> Self {
        Self {
            socket,
            handle: 0,
            caps,
            registration: None,
        }
    }

    /// Keep the producer-side client once the socket has reached the consumer.
    pub fn commit(&mut self) {
        if let Some(mut registration) = self.registration.take() {
            registration.committed = true;
        }
    }

    /// Commit and split into the socket and the capability string.
    pub fn into_parts(mut self) -> (IpcStream, String) {
        self.commit();
        (self.socket, self.caps)
    }
}

/// Removes a client from its sink on drop unless committed.
#[derive(Debug)]
pub(crate) struct Registration {
    sink: Arc<SocketSink>,
    id: ClientId,
    committed: bool,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.committed {
            self.sink.remove(self.id);
            warn!(client = self.id, "attach reply dropped before delivery; client removed");
        }
    }
}

/// Anything a consumer can attach through.
pub trait AttachService: Send + Sync {
    fn attach(&self) -> Result<AttachReply>;
}

impl<T: AttachService + ?Sized> AttachService for Arc<T> {
    fn attach(&self) -> Result<AttachReply> {
        (**self).attach()
    }
}

/// Producer side of the attach handshake.
pub struct Producer {
    sink: Arc<SocketSink>,
    caps: Arc<CapsSlot>,
    fault: Arc<dyn FaultHook>,
    config: AttachConfig,
}

impl Producer {
    /// Create a producer feeding `sink`, with the `attach_pre_return`
    /// checkpoint read from the environment.
    pub fn new(sink: Arc<SocketSink>, caps: Arc<CapsSlot>) -> Self {
        Self {
            sink,
            caps,
            fault: Arc::new(FaultInjectionPoint::from_env(ATTACH_PRE_RETURN)),
            config: AttachConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AttachConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the `attach_pre_return` checkpoint.
    pub fn with_fault_hook(mut self, fault: Arc<dyn FaultHook>) -> Self {
        self.fault = fault;
        self
    }

    pub fn sink(&self) -> &Arc<SocketSink> {
        &self.sink
    }

    pub fn caps(&self) -> &Arc<CapsSlot> {
        &self.caps
    }

    pub fn config(&self) -> &AttachConfig {
        &self.config
    }
}

impl AttachService for Producer {
    fn attach(&self) -> Result<AttachReply> {
        let (ours, theirs) = IpcStream::pair()?;
        let id = self.sink.add(ours)?;

        let finish = || -> Result<String> {
            let caps = self
                .caps
                .wait(self.config.caps_timeout, self.config.caps_poll_interval)
                .ok_or(PeerError::HandshakeTimeout(self.config.caps_timeout))?;
            self.fault
                .check()
                .map_err(|fault| PeerError::HandshakeFailed(fault.to_string()))?;
            Ok(caps)
        };

        match finish() {
            Ok(caps) => {
                info!(client = id, %caps, "consumer attached");
                Ok(AttachReply {
                    registration: Some(Registration {
                        sink: Arc::clone(&self.sink),
                        id,
                        committed: false,
                    }),
                    ..AttachReply::new(theirs, caps)
                })
            }
            Err(err) => {
                self.sink.remove(id);
                warn!(client = id, error = %err, "attach failed");
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("sink", &self.sink)
            .field("caps", &self.caps.get())
            .field("fault", &self.fault.name())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use shmpipe_frame::{Payloader, PayloaderConfig, FRAME_SEND};

    use super::*;
    use crate::sink::SinkConfig;

    fn producer(caps: Option<&str>, faults: &str) -> Producer {
        let payloader = Payloader::new(PayloaderConfig::default())
            .with_fault_hook(Arc::new(FaultInjectionPoint::disabled(FRAME_SEND)));
        let sink = Arc::new(SocketSink::new(payloader, SinkConfig::default()));
        let slot = Arc::new(match caps {
            Some(caps) => CapsSlot::with_caps(caps),
            None => CapsSlot::new(),
        });
        Producer::new(sink, slot)
            .with_fault_hook(Arc::new(FaultInjectionPoint::with_commands(
                ATTACH_PRE_RETURN,
                faults,
            )))
            .with_config(AttachConfig {
                caps_timeout: Duration::from_millis(100),
                caps_poll_interval: Duration::from_millis(5),
            })
    }

    #[test]
    fn attach_registers_client_and_returns_caps() {
        let producer = producer(Some("video/x-raw"), "");
        let reply = producer.attach().expect("attach should succeed");
        assert_eq!(reply.caps, "video/x-raw");
        assert_eq!(reply.handle, 0);
        assert_eq!(producer.sink().client_count(), 1);
    }

    #[test]
    fn attach_times_out_without_caps_and_unregisters() {
        let producer = producer(None, "");
        let start = Instant::now();
        let err = producer.attach().expect_err("attach should time out");
        assert!(matches!(err, PeerError::HandshakeTimeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(producer.sink().client_count(), 0);
    }

    #[test]
    fn injected_fault_fails_attach_and_unregisters() {
        let producer = producer(Some("caps"), "error");
        let err = producer.attach().expect_err("fault should fail attach");
        assert!(matches!(err, PeerError::HandshakeFailed(_)));
        assert_eq!(producer.sink().client_count(), 0);

        producer.attach().expect("second attach passes").commit();
        assert_eq!(producer.sink().client_count(), 1);
    }

    #[test]
    fn uncommitted_reply_unregisters_on_drop() {
        let producer = producer(Some("caps"), "");
        let reply = producer.attach().expect("attach");
        assert_eq!(producer.sink().client_count(), 1);
        drop(reply);
        assert_eq!(producer.sink().client_count(), 0);

        let (_socket, caps) = producer.attach().expect("attach").into_parts();
        assert_eq!(caps, "caps");
        assert_eq!(producer.sink().client_count(), 1);
    }

    #[test]
    fn attach_through_arc() {
        let producer: Arc<dyn AttachService> = Arc::new(producer(Some("c"), ""));
        assert_eq!(producer.attach().expect("attach").caps, "c");
    }
}
