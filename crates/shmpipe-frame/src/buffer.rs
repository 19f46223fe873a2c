//! Frame buffers and the descriptor-backed memory they may live in.

use std::fs::File;
use std::io;
use std::ops::Deref;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use bytes::Bytes;
use memmap2::{Mmap, MmapOptions};

/// A byte range inside a file reachable only through its descriptor.
///
/// Owns the descriptor; dropping the region closes it.
#[derive(Debug)]
pub struct FdRegion {
    fd: OwnedFd,
    offset: u64,
    size: u64,
    readonly: bool,
}

impl FdRegion {
    pub fn new(fd: OwnedFd, offset: u64, size: u64) -> Self {
        Self {
            fd,
            offset,
            size,
            readonly: false,
        }
    }

    /// A region received from a peer. Never mapped writable.
    pub fn new_readonly(fd: OwnedFd, offset: u64, size: u64) -> Self {
        Self {
            readonly: true,
            ..Self::new(fd, offset, size)
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Size of the backing file as reported by `fstat`.
    pub fn file_size(&self) -> io::Result<u64> {
        file_size(self.fd.as_fd())
    }

    /// Map the visible range read-only.
    pub fn map(&self) -> io::Result<RegionMap> {
        if self.size == 0 {
            return Ok(RegionMap { mmap: None });
        }
        let len = usize::try_from(self.size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "region too large to map"))?;
        // SAFETY: the mapping is read-only and stays valid after the
        // descriptor closes. Concurrent writers in other processes can change
        // the bytes underneath it, as with any shared memory segment.
        let mmap = unsafe {
            MmapOptions::new()
                .offset(self.offset)
                .len(len)
                .map(&self.fd)?
        };
        Ok(RegionMap { mmap: Some(mmap) })
    }

    /// Copy the visible range into heap memory.
    pub fn to_bytes(&self) -> io::Result<Bytes> {
        Ok(Bytes::copy_from_slice(&self.map()?))
    }

    /// Give up the region and keep only its descriptor.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for FdRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// A read-only view of an [`FdRegion`], unmapped on drop.
pub struct RegionMap {
    mmap: Option<Mmap>,
}

impl Deref for RegionMap {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.mmap {
            Some(mmap) => &mmap[..],
            None => &[],
        }
    }
}

pub(crate) fn file_size(fd: BorrowedFd<'_>) -> io::Result<u64> {
    let file = File::from(fd.try_clone_to_owned()?);
    Ok(file.metadata()?.len())
}

/// Where a buffer's bytes live.
#[derive(Debug)]
pub enum Memory {
    /// Ordinary process memory; must be copied into an arena to be sent by descriptor.
    Heap(Bytes),
    /// A single shareable descriptor-backed region.
    Region(FdRegion),
}

/// A video frame buffer with an optional presentation timestamp.
#[derive(Debug)]
pub struct VideoBuffer {
    memory: Memory,
    pts: Option<u64>,
}

impl VideoBuffer {
    /// A buffer over plain heap bytes.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            memory: Memory::Heap(bytes.into()),
            pts: None,
        }
    }

    /// A buffer over a descriptor-backed region.
    pub fn from_region(region: FdRegion) -> Self {
        Self {
            memory: Memory::Region(region),
            pts: None,
        }
    }

    /// Set the pipeline-relative presentation time in nanoseconds.
    pub fn with_pts(mut self, pts: u64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn pts(&self) -> Option<u64> {
        self.pts
    }

    pub fn set_pts(&mut self, pts: Option<u64>) {
        self.pts = pts;
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn into_memory(self) -> Memory {
        self.memory
    }

    /// Payload length in bytes.
    pub fn size(&self) -> u64 {
        match &self.memory {
            Memory::Heap(bytes) => bytes.len() as u64,
            Memory::Region(region) => region.size(),
        }
    }

    pub fn is_fd_backed(&self) -> bool {
        matches!(self.memory, Memory::Region(_))
    }

    /// Copy the payload out, mapping it first if descriptor-backed.
    pub fn to_bytes(&self) -> io::Result<Bytes> {
        match &self.memory {
            Memory::Heap(bytes) => Ok(bytes.clone()),
            Memory::Region(region) => region.to_bytes(),
        }
    }
}
