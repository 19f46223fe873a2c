use std::sync::{Arc, Mutex, PoisonError};

use shmpipe_frame::{DepayOutcome, Depayloader};
use tracing::{info, warn};

use crate::attach::AttachService;
use crate::connection::Connection;
use crate::error::Result;

/// A consumer that re-attaches transparently when its producer goes away.
///
/// When the current socket reaches end-of-stream the connection asks the
/// attach service for a new one. If that works, reading carries on without
/// the caller seeing the stream end; otherwise [`DepayOutcome::EndOfStream`]
/// is returned once.
pub struct Consumer {
    service: Arc<dyn AttachService>,
    connection: Arc<Connection>,
    depay: Depayloader,
    caps: Arc<Mutex<Option<String>>>,
}

impl Consumer {
    pub fn new(service: Arc<dyn AttachService>, depay: Depayloader) -> Result<Self> {
        let connection = Arc::new(Connection::new()?);
        let caps = Arc::new(Mutex::new(None));

        let handler_service = Arc::clone(&service);
        let handler_caps = Arc::clone(&caps);
        connection.set_eos_handler(move |conn| match handler_service.attach() {
            Ok(reply) => {
                let (socket, caps) = reply.into_parts();
                info!(%caps, "re-attached after end of stream");
                *handler_caps.lock().unwrap_or_else(PoisonError::into_inner) = Some(caps);
                conn.set_socket(socket);
            }
            Err(err) => warn!(error = %err, "re-attach failed"),
        });

        Ok(Self {
            service,
            connection,
            depay,
            caps,
        })
    }

    /// Attach and install the socket. Returns the producer's capability string.
    pub fn start(&self) -> Result<String> {
        let (socket, caps) = self.service.attach()?.into_parts();
        *self.caps.lock().unwrap_or_else(PoisonError::into_inner) = Some(caps.clone());
        self.connection.set_socket(socket);
        info!(%caps, "consumer started");
        Ok(caps)
    }

    /// Block until a frame, a flush, or end-of-stream.
    pub fn next_frame(&mut self) -> Result<DepayOutcome> {
        loop {
            match self.connection.depay(&mut self.depay)? {
                DepayOutcome::NeedMoreData => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Latest capability string received from the producer.
    pub fn caps(&self) -> Option<String> {
        self.caps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The underlying connection, for [`Connection::signal_unlock`] from
    /// another thread.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn depayloader_mut(&mut self) -> &mut Depayloader {
        &mut self.depay
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("connection", &self.connection)
            .field("depay", &self.depay)
            .field("caps", &self.caps())
            .finish()
    }
}
