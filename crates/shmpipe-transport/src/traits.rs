//! Descriptor-passing capabilities shared by every socket type in shmpipe.
//!
//! Payloaders write through [`SendFds`] and connections read through
//! [`RecvFds`], so tests can substitute in-memory fakes and higher layers can
//! hand out shared (`Arc`) sockets without caring about the concrete type.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use crate::scm;
use crate::stream::IpcStream;

/// A socket that can send bytes with file descriptors attached.
pub trait SendFds {
    /// Send `data` with `fds` attached to its first byte, waiting for buffer space.
    fn send_with_fds(&self, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize>;

    /// Send without waiting for buffer space; `WouldBlock` if nothing fits.
    fn try_send_with_fds(&self, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        self.send_with_fds(data, fds)
    }
}

/// A socket that can receive bytes together with file descriptors.
pub trait RecvFds {
    /// Receive into `buf`; descriptors that arrived with the bytes are appended to `fds`.
    fn recv_with_fds(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize>;
}

impl SendFds for IpcStream {
    fn send_with_fds(&self, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        IpcStream::send_with_fds(self, data, fds)
    }

    fn try_send_with_fds(&self, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        IpcStream::try_send_with_fds(self, data, fds)
    }
}

impl RecvFds for IpcStream {
    fn recv_with_fds(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
        IpcStream::recv_with_fds(self, buf, fds)
    }
}

impl SendFds for UnixStream {
    fn send_with_fds(&self, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        scm::send_with_fds(self.as_fd(), data, fds, false)
    }

    fn try_send_with_fds(&self, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        scm::send_with_fds(self.as_fd(), data, fds, true)
    }
}

impl RecvFds for UnixStream {
    fn recv_with_fds(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
        scm::recv_with_fds(self.as_fd(), buf, fds, false)
    }
}

impl<T: SendFds + ?Sized> SendFds for &T {
    fn send_with_fds(&self, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        (**self).send_with_fds(data, fds)
    }

    fn try_send_with_fds(&self, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        (**self).try_send_with_fds(data, fds)
    }
}

impl<T: SendFds + ?Sized> SendFds for Arc<T> {
    fn send_with_fds(&self, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        (**self).send_with_fds(data, fds)
    }

    fn try_send_with_fds(&self, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        (**self).try_send_with_fds(data, fds)
    }
}

impl<T: RecvFds + ?Sized> RecvFds for &T {
    fn recv_with_fds(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
        (**self).recv_with_fds(buf, fds)
    }
}

impl<T: RecvFds + ?Sized> RecvFds for Arc<T> {
    fn recv_with_fds(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
        (**self).recv_with_fds(buf, fds)
    }
}
