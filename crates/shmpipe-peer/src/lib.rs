//! Producer/consumer plumbing for shmpipe.
//!
//! The consumer side is a [`Connection`] whose socket can be replaced while
//! a read is blocked, driven by a [`Consumer`] that re-attaches on
//! end-of-stream. The producer side is a fan-out [`SocketSink`] plus the
//! attach handshake ([`Producer`]), reachable in-process or across
//! processes through an [`AttachEndpoint`].

pub mod attach;
pub mod caps;
pub mod connection;
pub mod consumer;
pub mod endpoint;
pub mod error;
pub mod sink;

pub use attach::{AttachConfig, AttachReply, AttachService, Producer};
pub use caps::CapsSlot;
pub use connection::{Connection, ConnectionState, ReceiveOutcome};
pub use consumer::Consumer;
pub use endpoint::{AttachClient, AttachEndpoint, EndpointConfig};
pub use error::{PeerError, Result};
pub use sink::{ClientId, RenderStats, SinkConfig, SocketSink};
