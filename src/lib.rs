//! # offheap
//!
//! Memory regions obtained directly from the operating system with `mmap`,
//! outside the heap allocator.
//!
//! A region is either anonymous (private scratch memory) or backed by a file
//! whose bytes are the region's contents. The crate covers the lifecycle of
//! such a region and nothing above it: carving the byte range into objects
//! is left to the caller.
//!
//! ## Features
//!
//! - **Anonymous or file-backed**: pick per allocation, or inherit the size of an existing file
//! - **Growth**: enlarge a file-backed region with explicit descriptor hand-off
//! - **Sync control**: blocking (`MS_SYNC`) or background (`MS_ASYNC`) flushes
//! - **Checked lifecycle**: use after free is an error, not memory corruption
//! - **Injectable capabilities**: swap the mapping or filesystem layer in tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! // Anonymous scratch memory
//! let mut scratch = offheap::allocate(10 * 1024, None)?;
//! scratch.write_at(0, b"hello")?;
//! scratch.free()?;
//!
//! // File-backed, grown later
//! let mut table = offheap::allocate(4096, Some(Path::new("/tmp/table.bin")))?;
//! table.block_until_sync()?;
//! let mut table = offheap::grow(&mut table, 8192)?;
//! table.free()?;
//! # Ok::<(), offheap::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod memory;
pub mod observability;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::memory::{AllocatorConfig, MemoryRegion, RegionAllocator, RegionState};
}

pub use error::{Error, ErrorKind, Result};
pub use memory::{
    MemoryRegion, RegionAllocator, allocate, background_sync, block_until_sync, free, grow,
    truncate_file,
};
