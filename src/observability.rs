//! Tracing integration for region lifecycle operations.
//!
//! offheap never prints on its own. Every lifecycle call runs inside a
//! `DEBUG` span named `region` with the operation, backing path and length
//! as fields; install a `tracing` subscriber to see them.
//!
//! ```rust,ignore
//! tracing_subscriber::fmt()
//!     .with_max_level(tracing::Level::DEBUG)
//!     .init();
//!
//! let region = offheap::allocate(4096, Some(std::path::Path::new("/tmp/region.bin")))?;
//! ```

use std::path::Path;
use tracing::{Level, Span, span};

/// Create a span for one region operation.
///
/// `path` is `None` for anonymous regions.
#[inline]
pub fn span_region_op(op: &'static str, path: Option<&Path>, len: usize) -> Span {
    match path {
        Some(path) => span!(Level::DEBUG, "region", op = op, path = %path.display(), len = len),
        None => span!(Level::DEBUG, "region", op = op, path = "<anonymous>", len = len),
    }
}

/// Enter a region span for the rest of the current scope.
pub fn instrument_region_op(
    op: &'static str,
    path: Option<&Path>,
    len: usize,
) -> tracing::span::EnteredSpan {
    span_region_op(op, path, len).entered()
}
