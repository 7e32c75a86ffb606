//! Parallel chunked transfer of one large object between two stores.
//!
//! The engine pulls an object from an [`ObjectSource`] with concurrent ranged
//! reads, lands the bytes in a local [`StagingBuffer`], then pushes them to a
//! [`MultipartSink`] as concurrently uploaded parts.
//!
//! # Pipeline
//!
//! 1. **Plan**: split the object into contiguous [`ChunkRange`]s
//! 2. **Download**: fetch ranges in parallel into the staging file
//! 3. **Hash**: stream the staging file once for a content digest
//! 4. **Upload**: read parts sequentially, send them in parallel, commit
//! 5. **Validate**: compare the destination size with the staged size
//!
//! The staging file is removed on every exit path.

pub mod digest;
pub mod download;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod retry;
pub mod sink;
pub mod source;
pub mod staging;
pub mod types;
pub mod upload;
pub mod validation;

pub use digest::{DigestAlgorithm, compute_digest};
pub use download::DownloadEngine;
pub use error::{JobError, TransferError};
#[cfg(any(test, feature = "testing"))]
pub use memory::{MemorySink, MemorySource};
pub use orchestrator::TransferOrchestrator;
pub use plan::{ChunkRange, plan_chunks};
pub use progress::SpeedCalculator;
pub use retry::RetryPolicy;
pub use sink::{MultipartSink, ObjectHead};
pub use source::ObjectSource;
pub use staging::{StagingBuffer, StagingWriter};
pub use types::{
    Phase, TransferEvent, TransferJob, TransferOptions, TransferOutcome, TransferReport,
    TransferState, UploadPart, UploadSession, VerifyMode,
};
pub use upload::UploadEngine;
pub use validation::{validate_destination_key, validate_job};

/// Default chunk and part size: 10 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Default number of concurrent workers per phase.
pub const DEFAULT_WORKERS: usize = 15;

/// Default number of attempts for a single chunk or part operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
