//! Ranged-read source capability.
//!
//! Implemented by concrete store clients (see `blobferry-backends`) and by
//! the in-memory `MemorySource` under the `testing` feature. Keeping the
//! engine behind a trait decouples it from any wire protocol.

use std::future::Future;
use std::pin::Pin;

use crate::error::TransferError;

/// Boxed future returned by capability trait methods.
pub type TransferFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// A store that can report an object's size and serve arbitrary byte ranges.
///
/// Must tolerate many concurrent, non-overlapping `read_range` calls.
/// Failures are reported as [`TransferError::SourceRead`].
pub trait ObjectSource: Send + Sync {
    /// Total size of `object` in bytes.
    fn size<'a>(&'a self, object: &'a str) -> TransferFuture<'a, u64>;

    /// Reads `len` bytes of `object` starting at `offset`.
    fn read_range<'a>(&'a self, object: &'a str, offset: u64, len: u64)
    -> TransferFuture<'a, Vec<u8>>;
}
