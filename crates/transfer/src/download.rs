//! Parallel ranged download into the staging file.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info};

use crate::error::TransferError;
use crate::plan::ChunkRange;
use crate::progress::PhaseProgress;
use crate::retry::RetryPolicy;
use crate::source::ObjectSource;
use crate::staging::StagingBuffer;
use crate::types::{Phase, TransferEvent};

/// Fetches planned ranges concurrently and writes them at their offsets.
///
/// The worker pool (a semaphore plus a join set) lives only for one
/// [`run`](Self::run) call.
pub struct DownloadEngine {
    source: Arc<dyn ObjectSource>,
    workers: usize,
    retry: RetryPolicy,
    events: Option<mpsc::Sender<TransferEvent>>,
}

impl DownloadEngine {
    pub fn new(source: Arc<dyn ObjectSource>, workers: usize, retry: RetryPolicy) -> Self {
        Self {
            source,
            workers: workers.max(1),
            retry,
            events: None,
        }
    }

    /// Forwards per-chunk progress to `events`.
    pub fn with_events(mut self, events: Option<mpsc::Sender<TransferEvent>>) -> Self {
        self.events = events;
        self
    }

    /// Downloads every range of `object` into `staging`.
    ///
    /// All dispatched chunks are awaited even after a failure; siblings are
    /// not cancelled. The first failure collected is returned.
    pub async fn run(
        &self,
        object: &str,
        ranges: &[ChunkRange],
        staging: &StagingBuffer,
    ) -> Result<(), TransferError> {
        let mut progress = PhaseProgress::new(Phase::Download, ranges.len(), self.events.clone());
        if ranges.is_empty() {
            return Ok(());
        }

        info!(
            object,
            chunks = ranges.len(),
            workers = self.workers,
            "starting parallel download"
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<Result<ChunkRange, TransferError>> = JoinSet::new();
        let writer = staging.writer();
        let object: Arc<str> = Arc::from(object);
        let mut first_error: Option<TransferError> = None;

        for &range in ranges {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| TransferError::Unexpected(format!("worker pool closed: {e}")))?;

            let source = Arc::clone(&self.source);
            let writer = writer.clone();
            let retry = self.retry.clone();
            let object = Arc::clone(&object);

            tasks.spawn(async move {
                let _permit = permit;
                let data = fetch_range(source.as_ref(), &object, &range, &retry).await?;
                writer.write_chunk(&range, &data).await?;
                debug!(chunk = range.index, bytes = data.len(), "chunk staged");
                Ok(range)
            });

            while let Some(joined) = tasks.try_join_next() {
                collect(joined, &mut progress, &mut first_error);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            collect(joined, &mut progress, &mut first_error);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(chunks = progress.completed(), "download complete");
                Ok(())
            }
        }
    }
}

/// Reads one range with retries; a wrong-length answer counts as a failed read.
async fn fetch_range(
    source: &dyn ObjectSource,
    object: &str,
    range: &ChunkRange,
    retry: &RetryPolicy,
) -> Result<Vec<u8>, TransferError> {
    let (start, len, index) = (range.start, range.len(), range.index);
    retry
        .run("read_range", move || async move {
            let data = source.read_range(object, start, len).await?;
            if data.len() as u64 != len {
                return Err(TransferError::SourceRead(format!(
                    "chunk {index}: expected {len} bytes at offset {start}, got {}",
                    data.len()
                )));
            }
            Ok(data)
        })
        .await
}

fn collect(
    joined: Result<Result<ChunkRange, TransferError>, JoinError>,
    progress: &mut PhaseProgress,
    first_error: &mut Option<TransferError>,
) {
    match joined.map_err(TransferError::from).and_then(|r| r) {
        Ok(range) => progress.advance(range.len()),
        Err(e) => {
            error!(error = %e, "chunk download failed");
            first_error.get_or_insert(e);
        }
    }
}
