//! Parallel multipart upload from the staging file.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::TransferError;
use crate::progress::PhaseProgress;
use crate::retry::RetryPolicy;
use crate::sink::MultipartSink;
use crate::staging::StagingBuffer;
use crate::types::{Phase, TransferEvent, UploadPart, UploadSession};

/// Uploads a staged file as a multipart object.
///
/// Parts are read from a single reading point in ascending order and numbered
/// 1, 2, 3… as they are read. Transmission runs on a bounded pool and
/// completes in any order; the commit re-imposes part-number order. A worker
/// permit is taken before each read, so at most `workers` parts are buffered.
pub struct UploadEngine {
    sink: Arc<dyn MultipartSink>,
    workers: usize,
    retry: RetryPolicy,
    events: Option<mpsc::Sender<TransferEvent>>,
}

impl UploadEngine {
    pub fn new(sink: Arc<dyn MultipartSink>, workers: usize, retry: RetryPolicy) -> Self {
        Self {
            sink,
            workers: workers.max(1),
            retry,
            events: None,
        }
    }

    /// Forwards per-part progress to `events`.
    pub fn with_events(mut self, events: Option<mpsc::Sender<TransferEvent>>) -> Self {
        self.events = events;
        self
    }

    /// Uploads `staging` to `key` in parts of `part_size` bytes and commits.
    ///
    /// Returns the number of parts committed. On any failure after the
    /// session opened, the session is aborted before returning.
    pub async fn run(
        &self,
        key: &str,
        staging: &StagingBuffer,
        part_size: u64,
    ) -> Result<usize, TransferError> {
        let session_id = self.sink.begin_session(key).await?;
        info!(key, session = %session_id, "multipart session opened");

        let mut session = UploadSession::new(session_id, key);
        let dispatched = match self.transmit(&mut session, staging, part_size).await {
            Ok(dispatched) => dispatched,
            Err(e) => {
                error!(key, session = %session.session_id, error = %e, "part upload failed");
                self.abort(&session).await;
                return Err(e);
            }
        };

        self.finish(&session, dispatched).await
    }

    /// Reads, dispatches and collects every part. Returns the number dispatched.
    async fn transmit(
        &self,
        session: &mut UploadSession,
        staging: &StagingBuffer,
        part_size: u64,
    ) -> Result<u32, TransferError> {
        let mut reader = staging.part_reader(part_size).await?;
        let mut progress =
            PhaseProgress::new(Phase::Upload, reader.part_count(), self.events.clone());

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<Result<(UploadPart, u64), TransferError>> = JoinSet::new();
        let key: Arc<str> = Arc::from(session.key.as_str());
        let session_id: Arc<str> = Arc::from(session.session_id.as_str());
        let mut dispatched = 0u32;
        let mut first_error: Option<TransferError> = None;

        loop {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| TransferError::Unexpected(format!("worker pool closed: {e}")))?;

            let (part_number, data) = match reader.next_part().await {
                Ok(Some(part)) => part,
                Ok(None) => break,
                Err(e) => {
                    first_error.get_or_insert(e);
                    break;
                }
            };
            dispatched = part_number;

            let sink = Arc::clone(&self.sink);
            let retry = self.retry.clone();
            let key = Arc::clone(&key);
            let session_id = Arc::clone(&session_id);

            tasks.spawn(async move {
                let _permit = permit;
                let bytes = data.len() as u64;
                let content_id = retry
                    .run("upload_part", || {
                        sink.upload_part(&key, &session_id, part_number, data.clone())
                    })
                    .await?;
                debug!(part = part_number, bytes, "part uploaded");
                Ok((
                    UploadPart {
                        part_number,
                        content_id,
                    },
                    bytes,
                ))
            });

            while let Some(joined) = tasks.try_join_next() {
                collect(joined, session, &mut progress, &mut first_error);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            collect(joined, session, &mut progress, &mut first_error);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(dispatched),
        }
    }

    /// Commits the session with its parts in order, aborting it on failure.
    async fn finish(&self, session: &UploadSession, dispatched: u32) -> Result<usize, TransferError> {
        let result = async {
            let ordered = session.ordered_parts(dispatched)?;
            self.sink
                .complete_session(&session.key, &session.session_id, &ordered)
                .await?;
            Ok(ordered.len())
        }
        .await;

        match &result {
            Ok(parts) => info!(key = %session.key, parts, "multipart session committed"),
            Err(e) => {
                error!(key = %session.key, session = %session.session_id, error = %e, "commit failed");
                self.abort(session).await;
            }
        }
        result
    }

    /// Best-effort abort; a failure here is logged and never masks the cause.
    async fn abort(&self, session: &UploadSession) {
        match self
            .sink
            .abort_session(&session.key, &session.session_id)
            .await
        {
            Ok(()) => info!(session = %session.session_id, "multipart session aborted"),
            Err(e) => warn!(
                session = %session.session_id,
                error = %e,
                "failed to abort multipart session"
            ),
        }
    }
}

fn collect(
    joined: Result<Result<(UploadPart, u64), TransferError>, JoinError>,
    session: &mut UploadSession,
    progress: &mut PhaseProgress,
    first_error: &mut Option<TransferError>,
) {
    match joined.map_err(TransferError::from).and_then(|r| r) {
        Ok((part, bytes)) => {
            session.record(part);
            progress.advance(bytes);
        }
        Err(e) => {
            error!(error = %e, "part failed");
            first_error.get_or_insert(e);
        }
    }
}
