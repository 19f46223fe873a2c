//! Ancillary-data helpers: `sendmsg`/`recvmsg` with `SCM_RIGHTS`.
//!
//! File descriptors travel alongside the first byte of the message they are
//! attached to. On a stream socket the kernel never merges two messages that
//! both carry descriptors into one `recvmsg` call, but it may merge a
//! descriptor-bearing message into the tail of a plain read. Callers that need
//! to pair descriptors with a specific record must therefore read exactly the
//! bytes of that record and no more.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tracing::warn;

/// Maximum number of descriptors accepted from a single `recvmsg` call.
///
/// The wire protocol only ever sends one; a few extra slots let the receiver
/// see (and close) descriptors from a misbehaving peer instead of having the
/// kernel silently truncate them.
pub const MAX_FDS_PER_MESSAGE: usize = 8;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

/// Control buffer sized and aligned for a `cmsghdr` carrying `count` descriptors.
struct ControlBuffer {
    words: Vec<u64>,
    len: usize,
}

impl ControlBuffer {
    fn for_fds(count: usize) -> Self {
        if count == 0 {
            return Self {
                words: Vec::new(),
                len: 0,
            };
        }
        let payload = (count * std::mem::size_of::<RawFd>()) as libc::c_uint;
        // SAFETY: CMSG_SPACE is a pure size computation.
        let len = unsafe { libc::CMSG_SPACE(payload) } as usize;
        Self {
            words: vec![0u64; len.div_ceil(8)],
            len,
        }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        if self.len == 0 {
            std::ptr::null_mut()
        } else {
            self.words.as_mut_ptr().cast()
        }
    }
}

/// Send `data` with `fds` attached as `SCM_RIGHTS` ancillary data.
///
/// Returns the number of bytes of `data` accepted by the kernel. If that is
/// less than `data.len()` the descriptors have still been sent (they travel
/// with the first byte) and the remainder must be written without them.
pub fn send_with_fds(
    socket: BorrowedFd<'_>,
    data: &[u8],
    fds: &[BorrowedFd<'_>],
    nonblocking: bool,
) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut control = ControlBuffer::for_fds(fds.len());

    // SAFETY: an all-zero msghdr is a valid "empty" message header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !fds.is_empty() {
        msg.msg_control = control.as_mut_ptr();
        msg.msg_controllen = control.len as _;
        let payload = (fds.len() * std::mem::size_of::<RawFd>()) as libc::c_uint;

        // SAFETY: `msg_control` points at a zeroed, 8-byte aligned buffer of
        // CMSG_SPACE(payload) bytes, so CMSG_FIRSTHDR is non-null and the
        // header plus `fds.len()` descriptors fit inside it.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null() {
                return Err(io::Error::other("control buffer too small"));
            }
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload) as _;
            let slots = libc::CMSG_DATA(cmsg) as *mut RawFd;
            for (i, fd) in fds.iter().enumerate() {
                slots.add(i).write_unaligned(fd.as_raw_fd());
            }
        }
    }

    let mut flags = SEND_FLAGS;
    if nonblocking {
        flags |= libc::MSG_DONTWAIT;
    }

    loop {
        // SAFETY: `msg` references `iov` and `control`, both alive for the call.
        let rc = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, flags) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

/// Receive into `buf`, appending any `SCM_RIGHTS` descriptors to `fds`.
///
/// Received descriptors are close-on-exec. Returns `Ok(0)` on end-of-stream.
pub fn recv_with_fds(
    socket: BorrowedFd<'_>,
    buf: &mut [u8],
    fds: &mut Vec<OwnedFd>,
    nonblocking: bool,
) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut control = ControlBuffer::for_fds(MAX_FDS_PER_MESSAGE);

    // SAFETY: an all-zero msghdr is a valid "empty" message header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr();
    msg.msg_controllen = control.len as _;

    let mut flags = RECV_FLAGS;
    if nonblocking {
        flags |= libc::MSG_DONTWAIT;
    }

    let received = loop {
        // SAFETY: `msg` references `iov` (over `buf`) and `control`, both
        // valid and writable for the duration of the call.
        let rc = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, flags) };
        if rc >= 0 {
            break rc as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    };

    let before = fds.len();
    // SAFETY: the kernel filled `msg_control`/`msg_controllen`; the CMSG_*
    // macros walk only within that range, and every SCM_RIGHTS entry holds
    // descriptors freshly installed in this process that nothing else owns.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let header_len = libc::CMSG_LEN(0) as usize;
                let data_len = ((*cmsg).cmsg_len as usize).saturating_sub(header_len);
                let count = data_len / std::mem::size_of::<RawFd>();
                let slots = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count {
                    let raw = slots.add(i).read_unaligned();
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    for fd in &fds[before..] {
        set_cloexec(fd)?;
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        warn!(
            kept = fds.len() - before,
            "ancillary data truncated; extra descriptors were dropped by the kernel"
        );
    }

    Ok(received)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: `fd` is an open descriptor owned by the caller.
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Block until at least one of `fds` is readable (or hung up).
///
/// Returns one readiness flag per input descriptor. `None` waits forever.
/// An interrupted wait returns all-false so the caller can re-check its state.
pub fn poll_readable(fds: &[BorrowedFd<'_>], timeout: Option<Duration>) -> io::Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|fd| libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let timeout_ms = match timeout {
        None => -1,
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    };

    // SAFETY: `pollfds` is a valid array of `pollfds.len()` entries.
    let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(vec![false; fds.len()]);
        }
        return Err(err);
    }

    Ok(pollfds
        .iter()
        .map(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        .collect())
}
