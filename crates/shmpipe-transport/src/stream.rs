use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::error::{Result, TransportError};
use crate::scm;

/// A connected Unix stream socket that can carry file descriptors.
///
/// This is the fundamental I/O type of shmpipe. Every frame, and every
/// socket handed out by the attach handshake, travels over one of these.
pub struct IpcStream {
    inner: UnixStream,
}

impl IpcStream {
    /// Create a connected pair of stream sockets (close-on-exec).
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = UnixStream::pair().map_err(TransportError::SocketPair)?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Wrap an existing Unix stream.
    pub fn from_unix(stream: UnixStream) -> Self {
        Self { inner: stream }
    }

    /// Take ownership of a descriptor received from a peer.
    ///
    /// The caller asserts that `fd` refers to a connected stream socket.
    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Self::from_unix(UnixStream::from(fd))
    }

    /// Give up the socket as a plain owned descriptor.
    pub fn into_owned_fd(self) -> OwnedFd {
        OwnedFd::from(self.inner)
    }

    /// Send `data` with `fds` attached, blocking until the kernel accepts some bytes.
    pub fn send_with_fds(&self, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        scm::send_with_fds(self.inner.as_fd(), data, fds, false)
    }

    /// Like [`send_with_fds`](Self::send_with_fds) but fails with `WouldBlock`
    /// instead of waiting for socket buffer space.
    pub fn try_send_with_fds(&self, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        scm::send_with_fds(self.inner.as_fd(), data, fds, true)
    }

    /// Receive into `buf`, collecting attached descriptors into `fds`.
    pub fn recv_with_fds(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
        scm::recv_with_fds(self.inner.as_fd(), buf, fds, false)
    }

    /// Non-blocking receive; fails with `WouldBlock` when nothing is queued.
    pub fn try_recv_with_fds(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
        scm::recv_with_fds(self.inner.as_fd(), buf, fds, true)
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout).map_err(Into::into)
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_write_timeout(timeout).map_err(Into::into)
    }

    /// Toggle `O_NONBLOCK` on the underlying stream.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.inner.set_nonblocking(nonblocking).map_err(Into::into)
    }

    /// Shut down both directions; a blocked peer read observes end-of-stream.
    pub fn shutdown(&self) -> Result<()> {
        match self.inner.shutdown(std::net::Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        let cloned = self.inner.try_clone()?;
        Ok(Self::from_unix(cloned))
    }

    /// Get the credentials of the connected peer (Linux only).
    ///
    /// Returns `(uid, gid, pid)` via `SO_PEERCRED`, or `None` if unavailable.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable pointers for the provided sizes,
        // and the descriptor is an open Unix socket owned by this stream.
        let rc = unsafe {
            libc::getsockopt(
                self.inner.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    /// Get the credentials of the connected peer.
    ///
    /// Returns `None` on platforms that do not expose peer credentials.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl AsFd for IpcStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl AsRawFd for IpcStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl From<UnixStream> for IpcStream {
    fn from(stream: UnixStream) -> Self {
        Self::from_unix(stream)
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcStream")
            .field("fd", &self.inner.as_raw_fd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_connected() {
        let (mut left, mut right) = IpcStream::pair().unwrap();
        left.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn pair_is_close_on_exec() {
        let (left, _right) = IpcStream::pair().unwrap();
        // SAFETY: querying descriptor flags of an open socket.
        let flags = unsafe { libc::fcntl(left.as_raw_fd(), libc::F_GETFD) };
        assert!(flags & libc::FD_CLOEXEC != 0);
    }

    #[test]
    fn socket_survives_fd_roundtrip() {
        let (left, right) = IpcStream::pair().unwrap();
        let (carrier_tx, carrier_rx) = IpcStream::pair().unwrap();

        carrier_tx.send_with_fds(b"s", &[right.as_fd()]).unwrap();
        drop(right);

        let mut buf = [0u8; 1];
        let mut fds = Vec::new();
        carrier_rx.recv_with_fds(&mut buf, &mut fds).unwrap();
        assert_eq!(fds.len(), 1);

        let mut received = IpcStream::from_owned_fd(fds.pop().unwrap());
        (&left.inner).write_all(b"via-fd").unwrap();
        let mut out = [0u8; 6];
        received.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"via-fd");
    }

    #[test]
    fn shutdown_is_seen_as_eof() {
        let (left, mut right) = IpcStream::pair().unwrap();
        left.shutdown().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(right.read(&mut buf).unwrap(), 0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn peer_credentials_report_own_pid() {
        let (left, _right) = IpcStream::pair().unwrap();
        let (_, _, pid) = left.peer_credentials().unwrap();
        assert_eq!(pid, std::process::id());
    }
}
