//! Allocator configuration.

/// Permission bits used when `allocate` creates a missing backing file.
///
/// The process umask is applied on top, so the usual result is `0o644`.
pub const DEFAULT_FILE_MODE: u32 = 0o666;

/// Page size assumed by [`MemoryRegion::prefault`](super::MemoryRegion::prefault).
pub const PREFAULT_STRIDE: usize = 4096;

/// Configuration for a [`RegionAllocator`](super::RegionAllocator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Mode for newly created backing files.
    pub file_mode: u32,
    /// Touch every page right after mapping.
    pub prefault: bool,
    /// Flush file-backed regions synchronously when they are dropped while live.
    ///
    /// Explicit [`free`](super::MemoryRegion::free) never syncs.
    pub sync_on_drop: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            file_mode: DEFAULT_FILE_MODE,
            prefault: false,
            sync_on_drop: false,
        }
    }
}

impl AllocatorConfig {
    /// Config for regions that back persistent data: pages are flushed
    /// when a live region is dropped.
    pub fn durable() -> Self {
        Self {
            sync_on_drop: true,
            ..Self::default()
        }
    }

    /// Config for latency-sensitive scratch memory: pages are faulted in up front.
    pub fn prefaulted() -> Self {
        Self {
            prefault: true,
            ..Self::default()
        }
    }

    /// Set the mode for newly created backing files.
    pub fn with_file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    /// Enable or disable prefaulting.
    pub fn with_prefault(mut self, prefault: bool) -> Self {
        self.prefault = prefault;
        self
    }

    /// Enable or disable syncing on drop.
    pub fn with_sync_on_drop(mut self, sync_on_drop: bool) -> Self {
        self.sync_on_drop = sync_on_drop;
        self
    }
}
