//! Data types for the transfer flow.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::digest::DigestAlgorithm;
use crate::error::{JobError, TransferError};
use crate::retry::RetryPolicy;
use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_WORKERS};

/// A single object transfer request.
///
/// Immutable once built; the orchestrator owns it for the job's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    source: String,
    destination_key: String,
    workers: Option<usize>,
    chunk_size: Option<u64>,
}

impl TransferJob {
    /// Creates a job copying `source` to `destination_key`.
    pub fn new(source: impl Into<String>, destination_key: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination_key: destination_key.into(),
            workers: None,
            chunk_size: None,
        }
    }

    /// Overrides the per-phase worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Overrides the chunk/part size in bytes.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination_key(&self) -> &str {
        &self.destination_key
    }

    pub fn workers_override(&self) -> Option<usize> {
        self.workers
    }

    pub fn chunk_size_override(&self) -> Option<u64> {
        self.chunk_size
    }

    /// Worker count for this job: the override, else the options default.
    pub fn workers(&self, options: &TransferOptions) -> usize {
        self.workers.unwrap_or(options.workers)
    }

    /// Chunk size for this job: the override, else the options default.
    pub fn chunk_size(&self, options: &TransferOptions) -> u64 {
        self.chunk_size.unwrap_or(options.chunk_size)
    }
}

/// How the staged digest is used after upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// Digest is logged and reported only.
    #[default]
    Informational,
    /// Destination must report a matching digest.
    Strict,
}

/// Engine-wide settings shared by every job an orchestrator runs.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub workers: usize,
    pub chunk_size: u64,
    pub retry: RetryPolicy,
    pub digest: DigestAlgorithm,
    pub verify: VerifyMode,
    /// Directory for the staging file (system temp dir when `None`).
    pub staging_dir: Option<PathBuf>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            digest: DigestAlgorithm::default(),
            verify: VerifyMode::default(),
            staging_dir: None,
        }
    }
}

/// Pipeline phase, used to label failures and progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Configuration,
    Download,
    Hashing,
    Upload,
    Validation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Configuration => "configuration",
            Phase::Download => "download",
            Phase::Hashing => "hashing",
            Phase::Upload => "upload",
            Phase::Validation => "validation",
        };
        f.write_str(name)
    }
}

/// Orchestrator state machine.
///
/// `Idle → Downloading → Hashing → Uploading → Validating → {Succeeded, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Idle,
    Downloading,
    Hashing,
    Uploading,
    Validating,
    Succeeded,
    Failed,
}

impl TransferState {
    /// The phase that runs while in this state, if any.
    pub fn phase(self) -> Option<Phase> {
        match self {
            TransferState::Downloading => Some(Phase::Download),
            TransferState::Hashing => Some(Phase::Hashing),
            TransferState::Uploading => Some(Phase::Upload),
            TransferState::Validating => Some(Phase::Validation),
            _ => None,
        }
    }
}

/// A part accepted by the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPart {
    /// 1-based, assigned in read order.
    pub part_number: u32,
    /// Destination-issued identifier (ETag or equivalent).
    pub content_id: String,
}

/// An open multipart session and the parts collected for it.
///
/// Only the collecting task mutates `parts`; workers return results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub session_id: String,
    pub key: String,
    parts: Vec<UploadPart>,
}

impl UploadSession {
    pub fn new(session_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            key: key.into(),
            parts: Vec::new(),
        }
    }

    /// Records a completed part.
    pub fn record(&mut self, part: UploadPart) {
        self.parts.push(part);
    }

    /// Returns the parts sorted by part number, checked to be exactly `1..=dispatched`.
    pub fn ordered_parts(&self, dispatched: u32) -> Result<Vec<UploadPart>, TransferError> {
        let mut parts = self.parts.clone();
        parts.sort_by_key(|p| p.part_number);

        if parts.len() != dispatched as usize {
            return Err(TransferError::DestinationUpload(format!(
                "incomplete part list: {} of {dispatched} parts collected",
                parts.len()
            )));
        }
        for (expected, part) in (1..=dispatched).zip(&parts) {
            if part.part_number != expected {
                return Err(TransferError::DestinationUpload(format!(
                    "incomplete part list: expected part {expected}, found {}",
                    part.part_number
                )));
            }
        }
        Ok(parts)
    }
}

/// Progress and lifecycle events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    StateChanged(TransferState),
    Progress {
        phase: Phase,
        completed: usize,
        total: usize,
        bytes_per_second: f64,
    },
    Succeeded {
        size: u64,
    },
    Failed {
        phase: Phase,
        error: String,
    },
}

/// Summary of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    pub source: String,
    pub destination_key: String,
    /// Size reported by the destination after upload.
    pub size: u64,
    pub chunks: usize,
    pub parts: usize,
    pub digest_algorithm: DigestAlgorithm,
    pub digest: String,
}

/// User-facing outcome of a job: exactly one of success with size or failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<Phase>,
}

impl From<Result<TransferReport, JobError>> for TransferOutcome {
    fn from(result: Result<TransferReport, JobError>) -> Self {
        match result {
            Ok(report) => TransferOutcome {
                success: true,
                message: format!(
                    "{} transferred successfully to {} ({} bytes)",
                    report.source, report.destination_key, report.size
                ),
                size: Some(report.size),
                digest: Some(report.digest),
                failed_phase: None,
            },
            Err(e) => TransferOutcome {
                success: false,
                message: format!("error during transfer: {e}"),
                size: None,
                digest: None,
                failed_phase: Some(e.phase),
            },
        }
    }
}
