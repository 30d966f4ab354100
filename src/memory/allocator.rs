//! Region allocator: sizing and backing decisions for new regions.

use super::config::AllocatorConfig;
use super::filesystem::{FileSystem, SystemFileSystem};
use super::mapper::{Mapper, SystemMapper};
use super::region::MemoryRegion;
use crate::error::{Error, Result};
use crate::observability::instrument_region_op;
use rustix::fd::{AsFd, OwnedFd};
use std::path::Path;
use std::ptr::NonNull;

/// Creates [`MemoryRegion`]s from a mapping and a filesystem capability.
///
/// # Example
///
/// ```rust
/// use offheap::memory::{AllocatorConfig, RegionAllocator};
///
/// let allocator = RegionAllocator::with_config(AllocatorConfig::prefaulted());
/// let mut scratch = allocator.allocate(64 * 1024, None).unwrap();
/// scratch.as_mut_slice().unwrap()[..5].copy_from_slice(b"hello");
/// scratch.free().unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct RegionAllocator<M: Mapper = SystemMapper, F: FileSystem = SystemFileSystem> {
    mapper: M,
    fs: F,
    config: AllocatorConfig,
}

impl RegionAllocator {
    /// Allocator over the host's `mmap` and filesystem with default config.
    pub fn new() -> Self {
        Self::with_config(AllocatorConfig::default())
    }

    /// Allocator over the host's `mmap` and filesystem.
    pub fn with_config(config: AllocatorConfig) -> Self {
        Self::with_backends(SystemMapper, SystemFileSystem, config)
    }
}

impl Default for RegionAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Mapper, F: FileSystem> RegionAllocator<M, F> {
    /// Allocator over custom capabilities.
    pub fn with_backends(mapper: M, fs: F, config: AllocatorConfig) -> Self {
        Self { mapper, fs, config }
    }

    /// The allocator's configuration.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Map a new region.
    ///
    /// Without a path (or with an empty one) the region is anonymous and
    /// `size_bytes` must be non-negative.
    ///
    /// With a path, the file is created if missing or opened read-write if
    /// present. A negative `size_bytes` maps the file at its current size;
    /// otherwise the file is truncated or extended to exactly `size_bytes`.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] for a negative size without a path, or a
    ///   path that is a directory.
    /// - [`Error::Io`] if creating, opening, sizing the file fails.
    /// - [`Error::Mapping`] if `mmap` fails.
    ///
    /// A file created or resized before a later step failed is left as is.
    pub fn allocate(&self, size_bytes: i64, path: Option<&Path>) -> Result<MemoryRegion<M, F>> {
        let path = path.filter(|p| !p.as_os_str().is_empty());
        let _span = instrument_region_op("allocate", path, usize::try_from(size_bytes).unwrap_or(0));

        let (fd, file_len) = match path {
            None if size_bytes < 0 => {
                return Err(Error::config(
                    "allocate",
                    None,
                    format!("size {size_bytes} is negative and no backing path was given"),
                ));
            }
            None => (None, 0),
            Some(path) => {
                let (fd, file_len) = self.open_backing(path, size_bytes)?;
                (Some(fd), file_len)
            }
        };

        let len = match &fd {
            Some(_) => file_len,
            None => size_bytes as u64,
        };
        let len = usize::try_from(len).map_err(|_| {
            Error::config(
                "allocate",
                path,
                format!("size {len} does not fit in the address space"),
            )
        })?;

        let ptr = self.map(fd.as_ref(), len, path)?;

        tracing::debug!(len, file_backed = fd.is_some(), "region allocated");
        Ok(MemoryRegion::new_live(
            ptr,
            len,
            file_len,
            path.map(Path::to_path_buf),
            fd,
            self.mapper.clone(),
            self.fs.clone(),
            self.config,
        ))
    }

    /// Map an anonymous region of `size` bytes.
    pub fn allocate_anonymous(&self, size: usize) -> Result<MemoryRegion<M, F>> {
        let size = i64::try_from(size).map_err(|_| {
            Error::config("allocate", None, format!("size {size} is too large"))
        })?;
        self.allocate(size, None)
    }

    /// Map the file at `path`, keeping its current size.
    pub fn open_existing<P: AsRef<Path>>(&self, path: P) -> Result<MemoryRegion<M, F>> {
        self.allocate(-1, Some(path.as_ref()))
    }

    fn open_backing(&self, path: &Path, size_bytes: i64) -> Result<(OwnedFd, u64)> {
        if self.fs.is_dir(path) {
            return Err(Error::config(
                "allocate",
                Some(path),
                "path already exists as a directory",
            ));
        }

        let fd = if self.fs.exists(path) {
            self.fs
                .open_rw(path)
                .map_err(|e| Error::io("allocate (open)", Some(path), e))?
        } else {
            tracing::debug!(path = %path.display(), "creating backing file");
            self.fs
                .create(path, self.config.file_mode)
                .map_err(|e| Error::io("allocate (create)", Some(path), e))?
        };

        let file_len = match u64::try_from(size_bytes) {
            Ok(len) => {
                self.fs
                    .truncate(fd.as_fd(), len)
                    .map_err(|e| Error::io("allocate (truncate)", Some(path), e))?;
                len
            }
            Err(_) => self
                .fs
                .size(fd.as_fd())
                .map_err(|e| Error::io("allocate (stat)", Some(path), e))?,
        };

        Ok((fd, file_len))
    }

    fn map(&self, fd: Option<&OwnedFd>, len: usize, path: Option<&Path>) -> Result<NonNull<u8>> {
        if len == 0 {
            return Ok(NonNull::dangling());
        }
        let mapped = match fd {
            Some(fd) => self.mapper.map_file(fd.as_fd(), len),
            None => self.mapper.map_anonymous(len),
        };
        mapped.map_err(|e| Error::mapping("allocate", path, e))
    }
}

/// Map a new region with the system allocator.
///
/// See [`RegionAllocator::allocate`].
pub fn allocate(size_bytes: i64, path: Option<&Path>) -> Result<MemoryRegion> {
    RegionAllocator::new().allocate(size_bytes, path)
}

/// Resize only the backing file of `region`.
///
/// See [`MemoryRegion::truncate_file`].
pub fn truncate_file<M: Mapper, F: FileSystem>(
    region: &mut MemoryRegion<M, F>,
    new_size: i64,
) -> Result<()> {
    region.truncate_file(new_size)
}

/// Release `region`.
///
/// See [`MemoryRegion::free`].
pub fn free<M: Mapper, F: FileSystem>(region: &mut MemoryRegion<M, F>) -> Result<()> {
    region.free()
}

/// Flush `region` and wait for write-back.
pub fn block_until_sync<M: Mapper, F: FileSystem>(region: &MemoryRegion<M, F>) -> Result<()> {
    region.block_until_sync()
}

/// Request a flush of `region` without waiting.
pub fn background_sync<M: Mapper, F: FileSystem>(region: &MemoryRegion<M, F>) -> Result<()> {
    region.background_sync()
}

/// Grow a file-backed region, superseding `old_region`.
///
/// See [`MemoryRegion::grow`].
pub fn grow<M: Mapper, F: FileSystem>(
    old_region: &mut MemoryRegion<M, F>,
    new_size: i64,
) -> Result<MemoryRegion<M, F>> {
    old_region.grow(new_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::{RegionState, SyncMode};
    use rustix::fd::BorrowedFd;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Mapper that can be told to fail file mappings or unmaps, and counts calls.
    #[derive(Clone, Default)]
    struct FlakyMapper {
        fail_map_file: Arc<AtomicBool>,
        fail_unmap: Arc<AtomicBool>,
        maps: Arc<AtomicUsize>,
        unmaps: Arc<AtomicUsize>,
    }

    impl Mapper for FlakyMapper {
        fn map_anonymous(&self, len: usize) -> rustix::io::Result<NonNull<u8>> {
            self.maps.fetch_add(1, Ordering::SeqCst);
            SystemMapper.map_anonymous(len)
        }

        fn map_file(&self, fd: BorrowedFd<'_>, len: usize) -> rustix::io::Result<NonNull<u8>> {
            if self.fail_map_file.load(Ordering::SeqCst) {
                return Err(rustix::io::Errno::NOMEM);
            }
            self.maps.fetch_add(1, Ordering::SeqCst);
            SystemMapper.map_file(fd, len)
        }

        unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> rustix::io::Result<()> {
            self.unmaps.fetch_add(1, Ordering::SeqCst);
            // Release the pages either way so failing tests do not leak.
            unsafe { SystemMapper.unmap(ptr, len) }?;
            if self.fail_unmap.load(Ordering::SeqCst) {
                return Err(rustix::io::Errno::INVAL);
            }
            Ok(())
        }

        unsafe fn flush(
            &self,
            ptr: NonNull<u8>,
            len: usize,
            mode: SyncMode,
        ) -> rustix::io::Result<()> {
            unsafe { SystemMapper.flush(ptr, len, mode) }
        }
    }

    /// Filesystem whose `close` always reports an error after closing.
    #[derive(Clone, Default)]
    struct FailingCloseFs;

    impl FileSystem for FailingCloseFs {
        fn exists(&self, path: &Path) -> bool {
            SystemFileSystem.exists(path)
        }

        fn is_dir(&self, path: &Path) -> bool {
            SystemFileSystem.is_dir(path)
        }

        fn create(&self, path: &Path, mode: u32) -> io::Result<OwnedFd> {
            SystemFileSystem.create(path, mode)
        }

        fn open_rw(&self, path: &Path) -> io::Result<OwnedFd> {
            SystemFileSystem.open_rw(path)
        }

        fn size(&self, fd: BorrowedFd<'_>) -> io::Result<u64> {
            SystemFileSystem.size(fd)
        }

        fn truncate(&self, fd: BorrowedFd<'_>, len: u64) -> io::Result<()> {
            SystemFileSystem.truncate(fd, len)
        }

        fn close(&self, fd: OwnedFd) -> io::Result<()> {
            drop(fd);
            Err(io::Error::from_raw_os_error(libc::EIO))
        }
    }

    #[test]
    fn test_map_failure_leaves_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orphan.bin");

        let mapper = FlakyMapper::default();
        mapper.fail_map_file.store(true, Ordering::SeqCst);
        let allocator =
            RegionAllocator::with_backends(mapper, SystemFileSystem, AllocatorConfig::default());

        let err = allocator.allocate(8192, Some(path.as_path())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Mapping);
        assert_eq!(err.path(), Some(path.as_path()));

        // No rollback: the file was created and sized before mmap failed.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192);
    }

    #[test]
    fn test_grow_map_failure_keeps_old_region_live() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow-fail.bin");

        let mapper = FlakyMapper::default();
        let allocator = RegionAllocator::with_backends(
            mapper.clone(),
            SystemFileSystem,
            AllocatorConfig::default(),
        );
        let mut region = allocator.allocate(4096, Some(path.as_path())).unwrap();
        region.write_at(0, b"keep").unwrap();

        mapper.fail_map_file.store(true, Ordering::SeqCst);
        let err = region.grow(8192).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Mapping);

        assert!(region.is_live());
        assert!(region.raw_fd().is_some());
        assert_eq!(&region.as_slice().unwrap()[..4], b"keep");
        // The file was already enlarged.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192);
        assert_eq!(region.file_len(), 8192);
        assert_eq!(region.len(), 4096);

        region.free().unwrap();
    }

    #[test]
    fn test_grow_unmaps_old_mapping_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow-count.bin");

        let mapper = FlakyMapper::default();
        let allocator = RegionAllocator::with_backends(
            mapper.clone(),
            SystemFileSystem,
            AllocatorConfig::default(),
        );
        let mut old = allocator.allocate(4096, Some(path.as_path())).unwrap();
        let mut grown = old.grow(16384).unwrap();
        assert_eq!(mapper.unmaps.load(Ordering::SeqCst), 1);

        old.free().unwrap();
        assert_eq!(old.state(), RegionState::Superseded);
        assert_eq!(mapper.unmaps.load(Ordering::SeqCst), 1);

        grown.free().unwrap();
        assert_eq!(mapper.unmaps.load(Ordering::SeqCst), 2);
        assert_eq!(mapper.maps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_failure_is_reported_after_unmap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("close-fail.bin");

        let mapper = FlakyMapper::default();
        let allocator = RegionAllocator::with_backends(
            mapper.clone(),
            FailingCloseFs,
            AllocatorConfig::default(),
        );
        let mut region = allocator.allocate(4096, Some(path.as_path())).unwrap();

        let err = region.free().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(mapper.unmaps.load(Ordering::SeqCst), 1);
        assert_eq!(region.state(), RegionState::Freed);
    }

    #[test]
    fn test_unmap_failure_carries_close_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unmap-close-fail.bin");

        let mapper = FlakyMapper::default();
        let allocator = RegionAllocator::with_backends(
            mapper.clone(),
            FailingCloseFs,
            AllocatorConfig::default(),
        );
        let mut region = allocator.allocate(4096, Some(path.as_path())).unwrap();

        mapper.fail_unmap.store(true, Ordering::SeqCst);
        let err = region.free().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Mapping);
        match &err {
            Error::Mapping {
                op, close_error, ..
            } => {
                assert_eq!(*op, "free");
                assert!(close_error.is_some());
            }
            other => panic!("expected Mapping error, got {other:?}"),
        }
        assert!(err.to_string().contains("also failed to close"));
        assert_eq!(region.state(), RegionState::Freed);
        assert!(region.raw_fd().is_none());

        // Released regions do not retry the unmap.
        region.free().unwrap();
        assert_eq!(mapper.unmaps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unmap_failure_without_close_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unmap-fail.bin");

        let mapper = FlakyMapper::default();
        let allocator = RegionAllocator::with_backends(
            mapper.clone(),
            SystemFileSystem,
            AllocatorConfig::default(),
        );
        let mut region = allocator.allocate(4096, Some(path.as_path())).unwrap();

        mapper.fail_unmap.store(true, Ordering::SeqCst);
        let err = region.free().unwrap_err();
        match &err {
            Error::Mapping {
                close_error, path: err_path, ..
            } => {
                assert!(close_error.is_none());
                assert_eq!(err_path.as_deref(), Some(path.as_path()));
            }
            other => panic!("expected Mapping error, got {other:?}"),
        }
        assert_eq!(region.state(), RegionState::Freed);
    }

    #[test]
    fn test_zero_length_skips_mapper() {
        let mapper = FlakyMapper::default();
        let allocator = RegionAllocator::with_backends(
            mapper.clone(),
            SystemFileSystem,
            AllocatorConfig::default(),
        );
        let mut region = allocator.allocate(0, None).unwrap();
        assert!(region.is_empty());
        assert!(region.as_slice().unwrap().is_empty());
        region.free().unwrap();

        assert_eq!(mapper.maps.load(Ordering::SeqCst), 0);
        assert_eq!(mapper.unmaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_path_is_anonymous() {
        let region = RegionAllocator::new()
            .allocate(1024, Some(Path::new("")))
            .unwrap();
        assert!(!region.is_file_backed());
        assert!(region.raw_fd().is_none());
    }

    #[test]
    fn test_allocate_anonymous_and_open_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("existing.bin");
        std::fs::write(&path, vec![5u8; 2048]).unwrap();

        let allocator = RegionAllocator::default();
        let scratch = allocator.allocate_anonymous(100).unwrap();
        assert_eq!(scratch.len(), 100);

        let region = allocator.open_existing(&path).unwrap();
        assert_eq!(region.len(), 2048);
        assert!(region.as_slice().unwrap().iter().all(|&b| b == 5));
    }

    #[test]
    fn test_file_mode_applied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private.bin");

        let allocator = RegionAllocator::with_config(AllocatorConfig::default().with_file_mode(0o600));
        let region = allocator.allocate(16, Some(path.as_path())).unwrap();
        drop(region);

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_prefault_config() {
        let allocator = RegionAllocator::with_config(AllocatorConfig::prefaulted());
        assert!(allocator.config().prefault);
        let region = allocator.allocate(5 * 4096, None).unwrap();
        assert_eq!(region.len(), 5 * 4096);
    }

    #[test]
    fn test_sync_on_drop_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("durable.bin");

        let allocator = RegionAllocator::with_config(AllocatorConfig::durable());
        {
            let mut region = allocator.allocate(4096, Some(path.as_path())).unwrap();
            region.write_at(100, b"persist").unwrap();
        }

        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[100..107], b"persist");
    }
}
