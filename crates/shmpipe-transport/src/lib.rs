//! Unix socket transport with file-descriptor passing.
//!
//! Provides the connected stream type every shmpipe frame travels over,
//! `SCM_RIGHTS` send/receive helpers, and a filesystem-path listener for
//! attach endpoints.
//!
//! This is the lowest layer of shmpipe. Everything else builds on top of
//! the [`IpcStream`] type provided here.

#[cfg(not(unix))]
compile_error!("shmpipe requires a Unix platform (SCM_RIGHTS descriptor passing)");

pub mod error;
pub mod scm;
pub mod stream;
pub mod traits;
pub mod uds;

pub use error::{Result, TransportError};
pub use stream::IpcStream;
pub use traits::{RecvFds, SendFds};
pub use uds::SocketListener;
