//! Memory-mapping capability.
//!
//! [`Mapper`] is the seam between a region's lifecycle and the OS `mmap`
//! family. [`SystemMapper`] forwards to `rustix::mm`; tests substitute
//! their own implementation to inject failures.

use rustix::fd::BorrowedFd;
use rustix::mm::{MapFlags, MsyncFlags, ProtFlags};
use std::ptr::NonNull;

/// How a flush waits for write-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Return only once dirty pages reached the backing file (`MS_SYNC`).
    Blocking,
    /// Schedule write-back and return immediately (`MS_ASYNC`).
    Background,
}

impl SyncMode {
    fn flags(self) -> MsyncFlags {
        match self {
            SyncMode::Blocking => MsyncFlags::SYNC,
            SyncMode::Background => MsyncFlags::ASYNC,
        }
    }
}

/// Capability to create and release read-write mappings.
///
/// All lengths passed in are non-zero; zero-length regions never reach the mapper.
pub trait Mapper: Clone + Send + Sync + 'static {
    /// Map `len` bytes of private anonymous memory.
    fn map_anonymous(&self, len: usize) -> rustix::io::Result<NonNull<u8>>;

    /// Map the first `len` bytes of `fd` as a shared read-write mapping.
    fn map_file(&self, fd: BorrowedFd<'_>, len: usize) -> rustix::io::Result<NonNull<u8>>;

    /// Release a mapping.
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must describe a mapping returned by this mapper that
    /// has not been unmapped yet, and no references into it may outlive the call.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> rustix::io::Result<()>;

    /// Write dirty pages of a file mapping back to the file.
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must describe a live mapping returned by this mapper.
    unsafe fn flush(&self, ptr: NonNull<u8>, len: usize, mode: SyncMode) -> rustix::io::Result<()>;
}

/// [`Mapper`] backed by the host's `mmap(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMapper;

impl Mapper for SystemMapper {
    fn map_anonymous(&self, len: usize) -> rustix::io::Result<NonNull<u8>> {
        // SAFETY: a null hint lets the kernel choose a fresh address range,
        // so no existing mapping is replaced.
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )?
        };
        NonNull::new(ptr.cast::<u8>()).ok_or(rustix::io::Errno::NOMEM)
    }

    fn map_file(&self, fd: BorrowedFd<'_>, len: usize) -> rustix::io::Result<NonNull<u8>> {
        // SAFETY: as above; the mapping keeps its own reference to the file.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )?
        };
        NonNull::new(ptr.cast::<u8>()).ok_or(rustix::io::Errno::NOMEM)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> rustix::io::Result<()> {
        // SAFETY: caller guarantees ptr/len came from this mapper and are still mapped.
        unsafe { rustix::mm::munmap(ptr.as_ptr().cast(), len) }
    }

    unsafe fn flush(&self, ptr: NonNull<u8>, len: usize, mode: SyncMode) -> rustix::io::Result<()> {
        // SAFETY: caller guarantees ptr/len describe a live mapping.
        unsafe { rustix::mm::msync(ptr.as_ptr().cast(), len, mode.flags()) }
    }
}
