//! Multipart-write destination capability.

use serde::{Deserialize, Serialize};

use crate::source::TransferFuture;
use crate::types::UploadPart;

/// Metadata the destination reports for a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHead {
    pub size: u64,
    /// Hex content digest, when the destination can provide one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// A store that accepts an object as numbered parts within a session.
///
/// Failures are reported as
/// [`TransferError::DestinationUpload`](crate::TransferError::DestinationUpload).
pub trait MultipartSink: Send + Sync {
    /// Opens a multipart session for `key` and returns its id.
    fn begin_session<'a>(&'a self, key: &'a str) -> TransferFuture<'a, String>;

    /// Stores one part and returns the destination's identifier for it.
    fn upload_part<'a>(
        &'a self,
        key: &'a str,
        session_id: &'a str,
        part_number: u32,
        data: Vec<u8>,
    ) -> TransferFuture<'a, String>;

    /// Commits the session with parts in ascending part-number order.
    fn complete_session<'a>(
        &'a self,
        key: &'a str,
        session_id: &'a str,
        parts: &'a [UploadPart],
    ) -> TransferFuture<'a, ()>;

    /// Discards the session and any parts stored under it.
    fn abort_session<'a>(&'a self, key: &'a str, session_id: &'a str) -> TransferFuture<'a, ()>;

    /// Reports the committed object's metadata.
    fn head_object<'a>(&'a self, key: &'a str) -> TransferFuture<'a, ObjectHead>;
}
