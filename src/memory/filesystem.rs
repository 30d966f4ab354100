//! Filesystem capability used to create and size backing files.

use rustix::fd::{BorrowedFd, IntoRawFd, OwnedFd};
use rustix::fs::{FileType, Mode, OFlags};
use std::io;
use std::path::Path;

/// Capability for the file operations a region's lifecycle needs.
pub trait FileSystem: Clone + Send + Sync + 'static {
    /// Whether anything exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Whether `path` is an existing directory.
    fn is_dir(&self, path: &Path) -> bool;

    /// Create (or truncate) the file at `path`, opened read-write.
    fn create(&self, path: &Path, mode: u32) -> io::Result<OwnedFd>;

    /// Open the existing file at `path` read-write.
    fn open_rw(&self, path: &Path) -> io::Result<OwnedFd>;

    /// Current size of the file in bytes.
    fn size(&self, fd: BorrowedFd<'_>) -> io::Result<u64>;

    /// Grow or shrink the file to exactly `len` bytes.
    fn truncate(&self, fd: BorrowedFd<'_>, len: u64) -> io::Result<()>;

    /// Close the descriptor, reporting failures that `Drop` would swallow.
    fn close(&self, fd: OwnedFd) -> io::Result<()>;
}

/// [`FileSystem`] backed by the host's syscalls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemFileSystem;

impl FileSystem for SystemFileSystem {
    fn exists(&self, path: &Path) -> bool {
        rustix::fs::stat(path).is_ok()
    }

    fn is_dir(&self, path: &Path) -> bool {
        rustix::fs::stat(path)
            .map(|st| FileType::from_raw_mode(st.st_mode as _) == FileType::Directory)
            .unwrap_or(false)
    }

    fn create(&self, path: &Path, mode: u32) -> io::Result<OwnedFd> {
        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC | OFlags::CLOEXEC,
            Mode::from_raw_mode(mode as _),
        )?;
        Ok(fd)
    }

    fn open_rw(&self, path: &Path) -> io::Result<OwnedFd> {
        let fd = rustix::fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())?;
        Ok(fd)
    }

    fn size(&self, fd: BorrowedFd<'_>) -> io::Result<u64> {
        let stat = rustix::fs::fstat(fd)?;
        u64::try_from(stat.st_size).map_err(|_| io::Error::other("negative file size"))
    }

    fn truncate(&self, fd: BorrowedFd<'_>, len: u64) -> io::Result<()> {
        rustix::fs::ftruncate(fd, len)?;
        Ok(())
    }

    fn close(&self, fd: OwnedFd) -> io::Result<()> {
        let raw = fd.into_raw_fd();
        // SAFETY: `raw` was just released from an OwnedFd, so this is its only owner.
        if unsafe { libc::close(raw) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}
