//! A contiguous memory region mapped directly from the OS.
//!
//! A [`MemoryRegion`] is either anonymous (private scratch memory that
//! vanishes on unmap) or backed by a file whose bytes *are* the region.
//! There is no header or metadata in the file: its length is the region's
//! length.
//!
//! # Lifecycle
//!
//! ```text
//! allocate ──► Live ──free──► Freed
//!               │
//!               └──grow──► Superseded   (+ a new Live region)
//! ```
//!
//! Only a `Live` region exposes its buffer. Operations on a `Freed` or
//! `Superseded` region fail with [`Error::RegionReleased`]; `free` on them
//! is a no-op. Buffer slices borrow the region, so the borrow checker
//! rejects freeing or growing a region while a slice is still in use.
//!
//! # Example
//!
//! ```rust,no_run
//! use offheap::allocate;
//! use std::path::Path;
//!
//! let mut region = allocate(4096, Some(Path::new("/tmp/region.bin")))?;
//! region.write_at(0, b"hello")?;
//! region.block_until_sync()?;
//!
//! let mut bigger = region.grow(8192)?;
//! assert!(!region.is_live());
//! assert_eq!(&bigger.as_slice()?[..5], b"hello");
//! bigger.free()?;
//! # Ok::<(), offheap::Error>(())
//! ```

use super::config::{AllocatorConfig, PREFAULT_STRIDE};
use super::filesystem::{FileSystem, SystemFileSystem};
use super::mapper::{Mapper, SyncMode, SystemMapper};
use crate::error::{Error, Result};
use crate::observability::instrument_region_op;
use rustix::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Lifecycle state of a [`MemoryRegion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionState {
    /// The buffer is mapped and may be read and written.
    Live,
    /// `grow` handed the descriptor to a new region and unmapped this one.
    Superseded,
    /// `free` released the mapping and the descriptor.
    Freed,
}

impl RegionState {
    fn as_str(self) -> &'static str {
        match self {
            RegionState::Live => "live",
            RegionState::Superseded => "superseded",
            RegionState::Freed => "freed",
        }
    }
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory obtained from the OS by `mmap`, outside the heap allocator.
///
/// Created by [`RegionAllocator::allocate`](super::RegionAllocator::allocate)
/// or the crate-level [`allocate`](crate::allocate). A live region that is
/// dropped is unmapped and its backing file closed.
pub struct MemoryRegion<M: Mapper = SystemMapper, F: FileSystem = SystemFileSystem> {
    state: RegionState,
    /// Start of the mapping. Dangling when `len == 0`.
    ptr: NonNull<u8>,
    /// Allocated length of the mapping.
    len: usize,
    /// Length the backing file was last sized to.
    file_len: u64,
    path: Option<PathBuf>,
    /// Owned while live and file-backed.
    fd: Option<OwnedFd>,
    mapper: M,
    fs: F,
    config: AllocatorConfig,
}

impl<M: Mapper, F: FileSystem> MemoryRegion<M, F> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_live(
        ptr: NonNull<u8>,
        len: usize,
        file_len: u64,
        path: Option<PathBuf>,
        fd: Option<OwnedFd>,
        mapper: M,
        fs: F,
        config: AllocatorConfig,
    ) -> Self {
        let region = Self {
            state: RegionState::Live,
            ptr,
            len,
            file_len,
            path,
            fd,
            mapper,
            fs,
            config,
        };
        if config.prefault {
            region.touch_pages();
        }
        region
    }

    /// Allocated length in bytes.
    ///
    /// This is the length the region was mapped with and is still reported
    /// after the region has been released.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Length the backing file was last sized to; 0 for anonymous regions.
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Path of the backing file, `None` for anonymous regions.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether the region is backed by a file.
    pub fn is_file_backed(&self) -> bool {
        self.path.is_some()
    }

    /// Raw descriptor of the backing file.
    ///
    /// `None` for anonymous regions and once the region no longer owns the
    /// descriptor (freed, or superseded by `grow`).
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RegionState {
        self.state
    }

    /// Whether the buffer may still be accessed.
    pub fn is_live(&self) -> bool {
        self.state == RegionState::Live
    }

    /// The mapped bytes.
    ///
    /// Fails with [`Error::OutOfBounds`] while the backing file is shorter
    /// than the mapping (after shrinking it with `truncate_file`), since the
    /// pages past end-of-file cannot be touched.
    pub fn as_slice(&self) -> Result<&[u8]> {
        self.ensure_live("as_slice")?;
        self.ensure_backed("as_slice")?;
        Ok(self.bytes())
    }

    /// The mapped bytes, mutably.
    ///
    /// Fails like [`as_slice`](Self::as_slice) while the file is shorter
    /// than the mapping.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        self.ensure_live("as_mut_slice")?;
        self.ensure_backed("as_mut_slice")?;
        Ok(self.bytes_mut())
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// For file-backed regions the range must also lie within the file.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.ensure_live("read_at")?;
        let range = self.checked_range("read_at", offset, buf.len())?;
        buf.copy_from_slice(&self.bytes()[range]);
        Ok(())
    }

    /// Copy `data` into the region starting at `offset`.
    ///
    /// For file-backed regions the range must also lie within the file.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.ensure_live("write_at")?;
        let range = self.checked_range("write_at", offset, data.len())?;
        self.bytes_mut()[range].copy_from_slice(data);
        Ok(())
    }

    /// Touch every page so later accesses do not fault.
    ///
    /// Fails like [`as_slice`](Self::as_slice) while the file is shorter
    /// than the mapping.
    pub fn prefault(&self) -> Result<()> {
        self.ensure_live("prefault")?;
        self.ensure_backed("prefault")?;
        self.touch_pages();
        Ok(())
    }

    /// Resize the backing file to `new_size` bytes.
    ///
    /// Only the file changes; the mapping keeps its length until the region
    /// is grown or re-allocated. While the file is shorter than the mapping,
    /// whole-buffer access fails and `read_at`/`write_at` are limited to the
    /// bytes the file still covers. Another process truncating the file is
    /// not tracked and still raises `SIGBUS` on access past end-of-file.
    pub fn truncate_file(&mut self, new_size: i64) -> Result<()> {
        let _span = instrument_region_op("truncate_file", self.path(), self.len);
        self.ensure_live("truncate_file")?;

        let Some(fd) = self.fd.as_ref() else {
            return Err(Error::config(
                "truncate_file",
                None,
                "region is anonymous and has no backing file",
            ));
        };
        let new_len = u64::try_from(new_size).map_err(|_| {
            Error::config(
                "truncate_file",
                self.path.as_deref(),
                format!("size {new_size} is negative"),
            )
        })?;

        self.fs
            .truncate(fd.as_fd(), new_len)
            .map_err(|e| Error::io("truncate_file", self.path.as_deref(), e))?;
        self.file_len = new_len;

        tracing::debug!(file_len = new_len, "backing file truncated");
        Ok(())
    }

    /// Flush dirty pages to the backing file and wait for completion.
    ///
    /// A no-op for anonymous regions, which have nothing to write back.
    pub fn block_until_sync(&self) -> Result<()> {
        self.sync("block_until_sync", SyncMode::Blocking)
    }

    /// Schedule a flush of dirty pages without waiting for it.
    ///
    /// Gives no ordering guarantee for writes made after the call. Without
    /// any sync, nothing written before `free` is guaranteed to reach disk.
    /// A no-op for anonymous regions.
    pub fn background_sync(&self) -> Result<()> {
        self.sync("background_sync", SyncMode::Background)
    }

    /// Enlarge the backing file to `new_size` bytes and map the larger extent.
    ///
    /// On success the returned region owns the descriptor, this region's
    /// mapping is released and it becomes [`RegionState::Superseded`]; its
    /// `free` is then a no-op. On failure this region stays live and keeps
    /// the descriptor, though the file may already have been enlarged.
    pub fn grow(&mut self, new_size: i64) -> Result<Self> {
        let _span = instrument_region_op("grow", self.path(), self.len);
        self.ensure_live("grow")?;

        let (Some(path), Some(fd)) = (self.path.as_deref(), self.fd.as_ref()) else {
            return Err(Error::config(
                "grow",
                None,
                "region is anonymous; only file-backed regions can grow",
            ));
        };
        let new_len = u64::try_from(new_size)
            .ok()
            .filter(|&n| n > self.len as u64 && n > self.file_len)
            .ok_or_else(|| {
                Error::config(
                    "grow",
                    Some(path),
                    format!(
                        "new size {new_size} must exceed allocated {} and file {} bytes",
                        self.len, self.file_len
                    ),
                )
            })?;
        let map_len = usize::try_from(new_len).map_err(|_| {
            Error::config(
                "grow",
                Some(path),
                format!("size {new_len} does not fit in the address space"),
            )
        })?;

        self.fs
            .truncate(fd.as_fd(), new_len)
            .map_err(|e| Error::io("grow", Some(path), e))?;
        self.file_len = new_len;
        let ptr = self
            .mapper
            .map_file(fd.as_fd(), map_len)
            .map_err(|e| Error::mapping("grow", Some(path), e))?;

        let fd = self.fd.take();
        self.state = RegionState::Superseded;
        if let Err(e) = self.unmap() {
            tracing::warn!(error = %e, "failed to unmap superseded region");
        }

        tracing::debug!(new_len, "region grown");
        Ok(Self::new_live(
            ptr,
            map_len,
            new_len,
            self.path.clone(),
            fd,
            self.mapper.clone(),
            self.fs.clone(),
            self.config,
        ))
    }

    /// Release the region: close the backing file, then unmap.
    ///
    /// The region is [`RegionState::Freed`] afterwards even if a step
    /// failed. An unmap failure is reported as [`Error::Mapping`] with any
    /// close failure attached; a close failure alone is [`Error::Io`].
    /// Freeing a region that was already freed or superseded does nothing.
    pub fn free(&mut self) -> Result<()> {
        let _span = instrument_region_op("free", self.path(), self.len);
        if !self.is_live() {
            tracing::debug!(state = %self.state, "free on released region ignored");
            return Ok(());
        }
        self.state = RegionState::Freed;

        let close_error = match self.fd.take() {
            Some(fd) => self.fs.close(fd).err(),
            None => None,
        };
        let unmapped = self.unmap();

        match (unmapped, close_error) {
            (Err(source), close_error) => Err(Error::Mapping {
                op: "free",
                path: self.path.clone(),
                source,
                close_error,
            }),
            (Ok(()), Some(e)) => Err(Error::io("free", self.path.as_deref(), e)),
            (Ok(()), None) => {
                tracing::debug!("region freed");
                Ok(())
            }
        }
    }

    fn sync(&self, op: &'static str, mode: SyncMode) -> Result<()> {
        let _span = instrument_region_op(op, self.path(), self.len);
        self.ensure_live(op)?;
        if self.fd.is_none() || self.len == 0 {
            return Ok(());
        }
        // SAFETY: live region, non-empty mapping owned by self.
        unsafe { self.mapper.flush(self.ptr, self.len, mode) }
            .map_err(|e| Error::mapping(op, self.path.as_deref(), e))
    }

    fn ensure_live(&self, op: &'static str) -> Result<()> {
        match self.state {
            RegionState::Live => Ok(()),
            state => Err(Error::RegionReleased {
                op,
                path: self.path.clone(),
                state: state.as_str(),
            }),
        }
    }

    fn checked_range(
        &self,
        op: &'static str,
        offset: usize,
        count: usize,
    ) -> Result<std::ops::Range<usize>> {
        offset
            .checked_add(count)
            .filter(|&end| end <= self.backed_len())
            .map(|end| offset..end)
            .ok_or(Error::OutOfBounds {
                op,
                offset,
                count,
                len: self.backed_len(),
            })
    }

    /// Bytes of the mapping that the backing file still covers.
    fn backed_len(&self) -> usize {
        match self.fd {
            Some(_) => usize::try_from(self.file_len).map_or(self.len, |file_len| file_len.min(self.len)),
            None => self.len,
        }
    }

    fn ensure_backed(&self, op: &'static str) -> Result<()> {
        let backed = self.backed_len();
        if backed < self.len {
            return Err(Error::OutOfBounds {
                op,
                offset: backed,
                count: self.len - backed,
                len: backed,
            });
        }
        Ok(())
    }

    /// The part of the mapping backed by the file. Callers check liveness.
    fn bytes(&self) -> &[u8] {
        // SAFETY: the region is live, so ptr/len describe a mapping owned by
        // self (or a dangling pointer with len 0), and the file covers the
        // first `backed_len` bytes. The returned borrow keeps `free`/`grow`
        // (which need &mut self) from running while it exists.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.backed_len()) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `bytes`; &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.backed_len()) }
    }

    /// Unmap the current mapping. Callers have already moved `state` off `Live`.
    fn unmap(&mut self) -> rustix::io::Result<()> {
        let (ptr, len) = (self.ptr, self.len);
        self.ptr = NonNull::dangling();
        if len == 0 {
            return Ok(());
        }
        // SAFETY: ptr/len came from this region's mapper, and the state
        // change means no new slices can be handed out.
        unsafe { self.mapper.unmap(ptr, len) }
    }

    fn touch_pages(&self) {
        let ptr = self.ptr.as_ptr();
        for offset in (0..self.len).step_by(PREFAULT_STRIDE) {
            // SAFETY: offset < len, inside the live mapping.
            unsafe {
                std::ptr::read_volatile(ptr.add(offset));
            }
        }
    }
}

impl<M: Mapper, F: FileSystem> fmt::Debug for MemoryRegion<M, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("state", &self.state)
            .field("path", &self.path)
            .field("fd", &self.raw_fd())
            .field("len", &self.len)
            .field("file_len", &self.file_len)
            .finish()
    }
}

impl<M: Mapper, F: FileSystem> Drop for MemoryRegion<M, F> {
    fn drop(&mut self) {
        if !self.is_live() {
            return;
        }
        if self.config.sync_on_drop {
            if let Err(e) = self.block_until_sync() {
                tracing::warn!(error = %e, "sync on drop failed");
            }
        }
        if let Err(e) = self.free() {
            tracing::warn!(error = %e, "failed to release region on drop");
        }
    }
}

// SAFETY: the region exclusively owns its mapping and descriptor. Shared
// references only hand out `&[u8]`; writes need `&mut self`. M and F are
// Send + Sync by their trait bounds.
unsafe impl<M: Mapper, F: FileSystem> Send for MemoryRegion<M, F> {}
unsafe impl<M: Mapper, F: FileSystem> Sync for MemoryRegion<M, F> {}
