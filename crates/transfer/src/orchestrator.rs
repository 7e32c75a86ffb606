//! Transfer orchestrator.
//!
//! Runs one job through download, hashing, upload and validation, strictly
//! in that order, and reports a single outcome. Lifecycle changes and
//! progress are published on an event channel.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::digest::digest_bytes;
use crate::download::DownloadEngine;
use crate::error::{JobError, TransferError};
use crate::plan::plan_chunks;
use crate::sink::{MultipartSink, ObjectHead};
use crate::source::ObjectSource;
use crate::staging::StagingBuffer;
use crate::types::{
    Phase, TransferEvent, TransferJob, TransferOptions, TransferOutcome, TransferReport,
    TransferState, VerifyMode,
};
use crate::upload::UploadEngine;
use crate::validation::validate_job;

/// Sequences the phases of a transfer between one source and one sink.
///
/// Jobs run one after another; [`state`](Self::state) reflects the job in
/// progress or the last one finished.
pub struct TransferOrchestrator {
    source: Arc<dyn ObjectSource>,
    sink: Arc<dyn MultipartSink>,
    options: TransferOptions,
    state: Mutex<TransferState>,
    events_tx: mpsc::Sender<TransferEvent>,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
}

impl TransferOrchestrator {
    pub fn new(
        source: Arc<dyn ObjectSource>,
        sink: Arc<dyn MultipartSink>,
        options: TransferOptions,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            source,
            sink,
            options,
            state: Mutex::new(TransferState::Idle),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransferState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `job` and returns the user-facing outcome.
    pub async fn execute(&self, job: &TransferJob) -> TransferOutcome {
        self.run(job).await.into()
    }

    /// Runs `job` to completion.
    ///
    /// On failure the open multipart session (if any) has been aborted and
    /// the staging file removed before this returns.
    pub async fn run(&self, job: &TransferJob) -> Result<TransferReport, JobError> {
        info!(
            source = job.source(),
            key = job.destination_key(),
            "transfer started"
        );

        let result = self.pipeline(job).await;

        match &result {
            Ok(report) => {
                self.transition(TransferState::Succeeded);
                self.emit(TransferEvent::Succeeded { size: report.size });
                info!(
                    source = %report.source,
                    key = %report.destination_key,
                    size = report.size,
                    parts = report.parts,
                    "transfer succeeded"
                );
            }
            Err(e) => {
                self.transition(TransferState::Failed);
                self.emit(TransferEvent::Failed {
                    phase: e.phase,
                    error: e.error.to_string(),
                });
                error!(
                    phase = %e.phase,
                    kind = e.error.kind(),
                    error = %e.error,
                    "transfer failed"
                );
            }
        }
        result
    }

    async fn pipeline(&self, job: &TransferJob) -> Result<TransferReport, JobError> {
        validate_job(job, &self.options).map_err(at(Phase::Configuration))?;

        self.transition(TransferState::Downloading);
        let size = self
            .options
            .retry
            .run("size", || self.source.size(job.source()))
            .await
            .map_err(at(Phase::Download))?;
        info!(source = job.source(), size, "source size resolved");

        if size == 0 {
            info!(source = job.source(), "source object is empty, nothing to transfer");
            return Ok(self.report(job, 0, 0, 0, digest_bytes(self.options.digest, b"")));
        }

        let staging = StagingBuffer::allocate(self.options.staging_dir.as_deref(), size)
            .await
            .map_err(at(Phase::Download))?;

        let result = self.staged(job, &staging).await;

        // Cleanup runs on every path; a failure here is logged and never
        // replaces the job's own result.
        if let Err(e) = staging.release() {
            warn!(error = %e, "failed to remove staging file");
        }
        result
    }

    async fn staged(
        &self,
        job: &TransferJob,
        staging: &StagingBuffer,
    ) -> Result<TransferReport, JobError> {
        let workers = job.workers(&self.options);
        let chunk_size = job.chunk_size(&self.options);
        let key = job.destination_key();

        let ranges = plan_chunks(staging.len(), chunk_size);
        DownloadEngine::new(Arc::clone(&self.source), workers, self.options.retry.clone())
            .with_events(Some(self.events_tx.clone()))
            .run(job.source(), &ranges, staging)
            .await
            .map_err(at(Phase::Download))?;

        self.transition(TransferState::Hashing);
        let digest = staging
            .digest(self.options.digest)
            .await
            .map_err(at(Phase::Hashing))?;
        info!(algorithm = %self.options.digest, digest = %digest, "staged content digest");

        self.transition(TransferState::Uploading);
        let parts = UploadEngine::new(Arc::clone(&self.sink), workers, self.options.retry.clone())
            .with_events(Some(self.events_tx.clone()))
            .run(key, staging, chunk_size)
            .await
            .map_err(at(Phase::Upload))?;

        self.transition(TransferState::Validating);
        let head = self
            .sink
            .head_object(key)
            .await
            .map_err(at(Phase::Validation))?;
        verify(&head, staging.len(), &digest, self.options.verify).map_err(at(Phase::Validation))?;

        Ok(self.report(job, head.size, ranges.len(), parts, digest))
    }

    fn report(
        &self,
        job: &TransferJob,
        size: u64,
        chunks: usize,
        parts: usize,
        digest: String,
    ) -> TransferReport {
        TransferReport {
            source: job.source().to_string(),
            destination_key: job.destination_key().to_string(),
            size,
            chunks,
            parts,
            digest_algorithm: self.options.digest,
            digest,
        }
    }

    fn transition(&self, next: TransferState) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, next)
        };
        debug!(from = ?previous, to = ?next, "state changed");
        self.emit(TransferEvent::StateChanged(next));
    }

    fn emit(&self, event: TransferEvent) {
        // Nobody may be listening; events are best-effort.
        let _ = self.events_tx.try_send(event);
    }
}

fn at(phase: Phase) -> impl Fn(TransferError) -> JobError {
    move |error| JobError::new(phase, error)
}

/// Compares what the destination reports with what was staged.
fn verify(
    head: &ObjectHead,
    staged_size: u64,
    staged_digest: &str,
    mode: VerifyMode,
) -> Result<(), TransferError> {
    if head.size != staged_size {
        return Err(TransferError::SizeMismatch {
            expected: staged_size,
            actual: head.size,
        });
    }

    match (mode, head.digest.as_deref()) {
        (VerifyMode::Informational, _) => Ok(()),
        (VerifyMode::Strict, Some(remote)) if remote.eq_ignore_ascii_case(staged_digest) => Ok(()),
        (VerifyMode::Strict, remote) => Err(TransferError::DigestMismatch {
            expected: staged_digest.to_string(),
            actual: remote.unwrap_or("<none>").to_string(),
        }),
    }
}
