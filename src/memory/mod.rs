//! Off-heap memory regions for offheap.
//!
//! This module maps memory straight from the OS, either anonymous and
//! private or backed by a file, and manages its lifecycle.
//!
//! # Architecture
//!
//! - [`RegionAllocator`]: Decides size and backing, creates regions
//! - [`MemoryRegion`]: One contiguous mapping with a checked live/freed state
//! - [`Mapper`]: Capability over `mmap`/`munmap`/`msync` ([`SystemMapper`])
//! - [`FileSystem`]: Capability over open/stat/truncate/close ([`SystemFileSystem`])
//!
//! # Example
//!
//! ```rust
//! use offheap::memory::RegionAllocator;
//!
//! let allocator = RegionAllocator::new();
//! let mut region = allocator.allocate(10 * 1024, None).unwrap();
//!
//! region.write_at(0, b"hello memory mapped WORLD\n").unwrap();
//! let mut back = [0u8; 26];
//! region.read_at(0, &mut back).unwrap();
//! assert_eq!(&back, b"hello memory mapped WORLD\n");
//!
//! region.free().unwrap();
//! ```

mod allocator;
mod config;
mod filesystem;
mod mapper;
mod region;

pub use allocator::{
    RegionAllocator, allocate, background_sync, block_until_sync, free, grow, truncate_file,
};
pub use config::{AllocatorConfig, DEFAULT_FILE_MODE, PREFAULT_STRIDE};
pub use filesystem::{FileSystem, SystemFileSystem};
pub use mapper::{Mapper, SyncMode, SystemMapper};
pub use region::{MemoryRegion, RegionState};
