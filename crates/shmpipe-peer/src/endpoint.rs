//! The attach RPC over a filesystem-path Unix socket.
//!
//! One request per connection. The consumer sends a single
//! newline-terminated JSON object:
//!
//! ```text
//! {"method":"attach"}
//! ```
//!
//! and the producer answers with one line, either
//! `{"caps":"…","handle":0}` with the consumer's socket attached as
//! `SCM_RIGHTS` ancillary data, or `{"error":"…"}` with no descriptors.

use std::io::ErrorKind;
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shmpipe_transport::{IpcStream, SocketListener, TransportError};
use tracing::{debug, info, warn};

use crate::attach::{AttachConfig, AttachReply, AttachService};
use crate::error::{PeerError, Result};

const ATTACH_METHOD: &str = "attach";
const ACCEPT_POLL: Duration = Duration::from_millis(100);
const REPLY_MARGIN: Duration = Duration::from_secs(5);

/// Configuration shared by [`AttachEndpoint`] and [`AttachClient`].
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Bound on each blocking read or write of the exchange.
    pub timeout: Duration,
    /// How long the client waits for the reply. It must outlast the
    /// producer's caps wait, or the producer answers a client that has gone.
    pub reply_timeout: Duration,
    /// Largest request or reply line accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            reply_timeout: AttachConfig::default().caps_timeout + REPLY_MARGIN,
            max_message_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct AttachRequest {
    method: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct AttachResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    caps: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    handle: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn map_io(err: std::io::Error, timeout: Duration) -> PeerError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => PeerError::Timeout(timeout),
        _ => TransportError::Io(err).into(),
    }
}

/// Read one newline-terminated line, collecting any descriptors that arrive.
fn read_line(
    stream: &IpcStream,
    max_message_size: usize,
    timeout: Duration,
    fds: &mut Vec<OwnedFd>,
) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = match stream.recv_with_fds(&mut chunk, fds) {
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(map_io(err, timeout)),
        };
        if n == 0 {
            return Err(PeerError::HandshakeFailed(
                "connection closed before a complete message".to_string(),
            ));
        }
        line.extend_from_slice(&chunk[..n]);
        if let Some(end) = line.iter().position(|&b| b == b'\n') {
            line.truncate(end);
            return Ok(line);
        }
        if line.len() > max_message_size {
            return Err(PeerError::HandshakeFailed(format!(
                "message exceeds {max_message_size} bytes"
            )));
        }
    }
}

/// Write `data`; `fds` ride on the first byte.
fn write_all(
    stream: &IpcStream,
    mut data: &[u8],
    fds: &[std::os::fd::BorrowedFd<'_>],
    timeout: Duration,
) -> Result<()> {
    let mut pending = fds;
    while !data.is_empty() {
        match stream.send_with_fds(data, pending) {
            Ok(0) => return Err(TransportError::NotConnected.into()),
            Ok(n) => {
                data = &data[n..];
                pending = &[];
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if !pending.is_empty() => return Err(TransportError::FdAttach(err).into()),
            Err(err) => return Err(map_io(err, timeout)),
        }
    }
    Ok(())
}

fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Serves the attach RPC for a local [`AttachService`].
pub struct AttachEndpoint {
    listener: SocketListener,
    service: Arc<dyn AttachService>,
    config: EndpointConfig,
}

impl AttachEndpoint {
    /// Bind a Unix socket path.
    pub fn bind(path: impl AsRef<Path>, service: Arc<dyn AttachService>) -> Result<Self> {
        let listener = SocketListener::bind(path)?;
        info!(path = %listener.path().display(), "attach endpoint listening");
        Ok(Self {
            listener,
            service,
            config: EndpointConfig::default(),
        })
    }

    pub fn with_config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Bound socket path.
    pub fn path(&self) -> &Path {
        self.listener.path()
    }

    /// Accept one connection and answer its request.
    pub fn serve_one(&self) -> Result<()> {
        let stream = self.listener.accept()?;
        self.handle(stream)
    }

    /// Answer requests until `shutdown` is set. Errors from individual
    /// requests are logged, not returned.
    pub fn serve(&self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            let Some(stream) = self.listener.accept_timeout(Some(ACCEPT_POLL))? else {
                continue;
            };
            if let Err(err) = self.handle(stream) {
                warn!(error = %err, "attach request failed");
            }
        }
        debug!("attach endpoint stopped");
        Ok(())
    }

    fn handle(&self, stream: IpcStream) -> Result<()> {
        stream.set_read_timeout(Some(self.config.timeout))?;
        stream.set_write_timeout(Some(self.config.timeout))?;

        let mut stray = Vec::new();
        let line = read_line(
            &stream,
            self.config.max_message_size,
            self.config.timeout,
            &mut stray,
        )?;
        drop(stray);

        let request: AttachRequest = match serde_json::from_slice(&line) {
            Ok(request) => request,
            Err(err) => {
                self.reply_error(&stream, &format!("invalid request: {err}"))?;
                return Err(err.into());
            }
        };
        if request.method != ATTACH_METHOD {
            let message = format!("unknown method: {}", request.method);
            self.reply_error(&stream, &message)?;
            return Err(PeerError::HandshakeFailed(message));
        }

        match self.service.attach() {
            Ok(mut reply) => {
                let response = AttachResponse {
                    caps: Some(reply.caps.clone()),
                    handle: Some(reply.handle),
                    error: None,
                };
                let line = encode_line(&response)?;
                // An unsent reply drops its registration with it.
                write_all(&stream, &line, &[reply.socket.as_fd()], self.config.timeout)?;
                reply.commit();
                debug!("attach reply sent");
                Ok(())
            }
            Err(err) => {
                self.reply_error(&stream, &err.to_string())?;
                Err(err)
            }
        }
    }

    fn reply_error(&self, stream: &IpcStream, message: &str) -> Result<()> {
        let response = AttachResponse {
            error: Some(message.to_string()),
            ..AttachResponse::default()
        };
        write_all(stream, &encode_line(&response)?, &[], self.config.timeout)
    }
}

impl std::fmt::Debug for AttachEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachEndpoint")
            .field("path", &self.listener.path())
            .field("config", &self.config)
            .finish()
    }
}

/// Calls the attach RPC on an [`AttachEndpoint`].
#[derive(Debug, Clone)]
pub struct AttachClient {
    path: PathBuf,
    config: EndpointConfig,
}

impl AttachClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            config: EndpointConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AttachService for AttachClient {
    fn attach(&self) -> Result<AttachReply> {
        let stream = SocketListener::connect(&self.path)?;
        stream.set_read_timeout(Some(self.config.timeout))?;
        stream.set_write_timeout(Some(self.config.timeout))?;

        let request = encode_line(&AttachRequest {
            method: ATTACH_METHOD.to_string(),
        })?;
        write_all(&stream, &request, &[], self.config.timeout)?;

        stream.set_read_timeout(Some(self.config.reply_timeout))?;
        let mut fds = Vec::new();
        let line = read_line(
            &stream,
            self.config.max_message_size,
            self.config.reply_timeout,
            &mut fds,
        )?;
        let response: AttachResponse = serde_json::from_slice(&line)?;

        if let Some(error) = response.error {
            return Err(PeerError::HandshakeFailed(error));
        }
        let caps = response
            .caps
            .ok_or_else(|| PeerError::HandshakeFailed("reply carries no caps".to_string()))?;
        let handle = response.handle.unwrap_or(0);

        let handle_index = handle as usize;
        if fds.len() != 1 || handle_index != 0 {
            return Err(PeerError::HandshakeFailed(format!(
                "expected one descriptor at handle 0, got {} (handle {handle})",
                fds.len()
            )));
        }
        let socket = IpcStream::from_owned_fd(fds.remove(handle_index));
        debug!(path = %self.path.display(), %caps, "attached");
        Ok(AttachReply {
            handle,
            ..AttachReply::new(socket, caps)
        })
    }
}
