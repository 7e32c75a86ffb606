//! Concrete collaborators for the blobferry transfer engine.
//!
//! - [`HttpRangeSource`]: reads objects from any range-capable HTTP server,
//!   including blob containers addressed with a signed URL.
//! - [`DirectorySink`]: a multipart object store on the local filesystem.

pub mod directory;
pub mod error;
pub mod http;

pub use directory::DirectorySink;
pub use error::BackendError;
pub use http::{HttpRangeSource, HttpTimeouts};
