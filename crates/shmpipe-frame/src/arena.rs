//! Shared-memory arena: anonymous, already-unlinked files on a memory-backed
//! filesystem, handed between processes by descriptor.
//!
//! Each allocation is its own file. Nothing is pooled or reused across
//! frames, so a consumer still holding an old frame never sees it change.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, trace};

use crate::buffer::FdRegion;
use crate::error::{FrameError, Result};

const FALLBACK_PAGE_SIZE: usize = 4096;
const MAX_CREATE_ATTEMPTS: usize = 16;

/// Suffix for arena file names, shared by every allocator in the process.
static NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Where and under what name arena files are created.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Directory for backing files. Default: `/dev/shm` if present, else the temp dir.
    pub directory: PathBuf,
    /// Leading part of each file name: `{prefix}-{pid}-{counter}`.
    pub name_prefix: String,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        let shm = PathBuf::from("/dev/shm");
        Self {
            directory: if shm.is_dir() {
                shm
            } else {
                std::env::temp_dir()
            },
            name_prefix: "shmpipe".to_string(),
        }
    }
}

/// Layout requested for a single allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationParams {
    /// Alignment mask for the start of the visible range (`0` = byte, `15` = 16 bytes).
    pub align: usize,
    /// Bytes reserved in front of the visible range.
    pub prefix: usize,
    /// Bytes reserved after the visible range.
    pub padding: usize,
}

/// Round `offset` up to the next multiple of `mask + 1`.
pub fn pad(offset: usize, mask: usize) -> Option<usize> {
    let unit = mask.checked_add(1)?;
    Some(offset.checked_add(mask)? / unit * unit)
}

/// Creates [`ArenaRegion`]s.
#[derive(Debug)]
pub struct ArenaAllocator {
    config: ArenaConfig,
    allocations: AtomicU64,
    page_mask: usize,
}

impl ArenaAllocator {
    pub fn new(config: ArenaConfig) -> Self {
        Self {
            config,
            allocations: AtomicU64::new(0),
            page_mask: page_size() - 1,
        }
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Number of backing files this allocator has created.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Allocate a region whose visible range holds `size` bytes.
    ///
    /// The backing file is `pad(size + pad(prefix, align) + padding, page)`
    /// bytes long; the visible range starts at `pad(prefix, align)`.
    pub fn allocate(&self, size: usize, params: &AllocationParams) -> Result<ArenaRegion> {
        let overflow = || FrameError::AllocationFailed {
            size,
            source: io::Error::new(io::ErrorKind::InvalidInput, "allocation size overflows"),
        };
        let offset = pad(params.prefix, params.align).ok_or_else(overflow)?;
        let capacity = size
            .checked_add(offset)
            .and_then(|n| n.checked_add(params.padding))
            .and_then(|n| pad(n, self.page_mask))
            .ok_or_else(overflow)?;

        let file = self
            .create_unlinked()
            .map_err(|source| FrameError::AllocationFailed { size, source })?;
        if capacity > 0 {
            reserve(&file, capacity as u64)
                .map_err(|source| FrameError::AllocationFailed { size, source })?;
        }

        debug!(size, capacity, offset, "allocated arena region");
        Ok(ArenaRegion {
            file,
            capacity,
            offset,
            size,
            mapping: None,
        })
    }

    /// Allocate a region of exactly `bytes.len()` and copy `bytes` into it.
    pub fn copy_allocate(&self, bytes: &[u8]) -> Result<ArenaRegion> {
        let region = self.allocate(bytes.len(), &AllocationParams::default())?;
        write_all_at(&region.file, bytes, region.offset as u64).map_err(|source| {
            FrameError::AllocationFailed {
                size: bytes.len(),
                source,
            }
        })?;
        Ok(region)
    }

    fn create_unlinked(&self) -> io::Result<File> {
        let pid = std::process::id();
        let mut last_err = None;

        for _ in 0..MAX_CREATE_ATTEMPTS {
            let n = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
            let path = self
                .config
                .directory
                .join(format!("{}-{pid}-{n}", self.config.name_prefix));

            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
            {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    last_err = Some(err);
                    continue;
                }
                Err(err) => return Err(err),
            };

            // Only the descriptor keeps the file alive from here on; it still
            // shows up under /proc/<pid>/fd under the name it was created with.
            std::fs::remove_file(&path)?;
            self.allocations.fetch_add(1, Ordering::Relaxed);
            trace!(?path, "created arena file");
            return Ok(file);
        }

        Err(last_err.unwrap_or_else(|| io::Error::other("could not create arena file")))
    }
}

impl Default for ArenaAllocator {
    fn default() -> Self {
        Self::new(ArenaConfig::default())
    }
}

/// An exclusively owned arena allocation, writable until handed off.
#[derive(Debug)]
pub struct ArenaRegion {
    file: File,
    capacity: usize,
    offset: usize,
    size: usize,
    mapping: Option<MmapMut>,
}

impl ArenaRegion {
    /// Length of the backing file.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Start of the visible range within the file.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the visible range.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The visible range, mapped writable on first use.
    pub fn as_mut_slice(&mut self) -> io::Result<&mut [u8]> {
        if self.size == 0 {
            return Ok(Default::default());
        }
        let range = self.offset..self.offset + self.size;
        let mapping = match &mut self.mapping {
            Some(mapping) => mapping,
            slot => {
                // SAFETY: the file was created by this process, is unlinked and
                // has not yet been shared, so nothing else can resize it.
                let mapping = unsafe { MmapOptions::new().len(self.capacity).map_mut(&self.file)? };
                slot.insert(mapping)
            }
        };
        Ok(&mut mapping[range])
    }

    /// Write `data` at `at` bytes into the visible range.
    pub fn write_at(&self, data: &[u8], at: usize) -> io::Result<()> {
        let end = at.checked_add(data.len()).unwrap_or(usize::MAX);
        if end > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write past end of arena region",
            ));
        }
        write_all_at(&self.file, data, (self.offset + at) as u64)
    }

    /// Hand the region off as a shareable [`FdRegion`], dropping any mapping.
    pub fn into_fd_region(self) -> FdRegion {
        FdRegion::new(
            OwnedFd::from(self.file),
            self.offset as u64,
            self.size as u64,
        )
    }
}

impl AsFd for ArenaRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

fn write_all_at(file: &File, mut data: &[u8], mut at: u64) -> io::Result<()> {
    while !data.is_empty() {
        match file.write_at(data, at) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                data = &data[n..];
                at += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Size the file, preferring block reservation without zero-filling.
#[cfg(target_os = "linux")]
fn reserve(file: &File, len: u64) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    // SAFETY: `file` is an open, writable regular file.
    let rc = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, len as libc::off_t) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) | Some(libc::EINTR) => file.set_len(len),
        _ => Err(err),
    }
}

#[cfg(not(target_os = "linux"))]
fn reserve(file: &File, len: u64) -> io::Result<()> {
    file.set_len(len)
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 && (size as usize).is_power_of_two() {
        size as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}
