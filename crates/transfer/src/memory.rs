//! In-process source and sink for tests.
//!
//! Compiled only under `cfg(test)` or the `testing` feature. Both sides
//! support fault injection and per-call delays so failure paths and
//! out-of-order completion can be exercised deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::digest::{DigestAlgorithm, digest_bytes};
use crate::error::TransferError;
use crate::sink::{MultipartSink, ObjectHead};
use crate::source::{ObjectSource, TransferFuture};
use crate::types::UploadPart;

type DelayFn = Box<dyn Fn(u64) -> Duration + Send + Sync>;

/// Tracks how many calls are in flight and the peak seen.
#[derive(Debug, Default)]
struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Takes one injected failure for `key` if any remain.
fn take_failure<K: std::hash::Hash + Eq>(failures: &Mutex<HashMap<K, u32>>, key: &K) -> bool {
    let mut failures = failures.lock().unwrap_or_else(|e| e.into_inner());
    match failures.get_mut(key) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// An [`ObjectSource`] serving objects held in memory.
#[derive(Default)]
pub struct MemorySource {
    objects: HashMap<String, Arc<Vec<u8>>>,
    /// Remaining injected failures keyed by range offset.
    read_failures: Mutex<HashMap<u64, u32>>,
    /// Offsets whose reads return one byte short.
    short_reads: Vec<u64>,
    delay: Option<DelayFn>,
    reads: AtomicUsize,
    concurrency: Concurrency,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an object.
    pub fn with_object(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.objects.insert(name.into(), Arc::new(data));
        self
    }

    /// Makes reads starting at `offset` fail `times` times (`u32::MAX` = always).
    pub fn failing_read(self, offset: u64, times: u32) -> Self {
        self.read_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(offset, times);
        self
    }

    /// Makes reads starting at `offset` return one byte fewer than requested.
    pub fn short_read(mut self, offset: u64) -> Self {
        self.short_reads.push(offset);
        self
    }

    /// Delays each read by `delay(offset)`.
    pub fn with_delay(mut self, delay: impl Fn(u64) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Some(Box::new(delay));
        self
    }

    /// Number of `read_range` calls served, including failed ones.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Highest number of reads observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.concurrency.peak.load(Ordering::SeqCst)
    }

    fn object(&self, name: &str) -> Result<Arc<Vec<u8>>, TransferError> {
        self.objects
            .get(name)
            .cloned()
            .ok_or_else(|| TransferError::SourceRead(format!("object not found: {name}")))
    }
}

impl ObjectSource for MemorySource {
    fn size<'a>(&'a self, object: &'a str) -> TransferFuture<'a, u64> {
        Box::pin(async move { Ok(self.object(object)?.len() as u64) })
    }

    fn read_range<'a>(
        &'a self,
        object: &'a str,
        offset: u64,
        len: u64,
    ) -> TransferFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.concurrency.enter();
            if let Some(delay) = &self.delay {
                tokio::time::sleep(delay(offset)).await;
            }
            let result = (|| {
                if take_failure(&self.read_failures, &offset) {
                    return Err(TransferError::SourceRead(format!(
                        "injected failure at offset {offset}"
                    )));
                }
                let data = self.object(object)?;
                let start = offset as usize;
                let mut end = (offset + len).min(data.len() as u64) as usize;
                if start > end {
                    return Err(TransferError::SourceRead(format!(
                        "range start {offset} beyond object size {}",
                        data.len()
                    )));
                }
                if self.short_reads.contains(&offset) && end > start {
                    end -= 1;
                }
                Ok(data[start..end].to_vec())
            })();
            self.concurrency.exit();
            result
        })
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PendingSession {
    key: String,
    parts: HashMap<u32, (String, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct SinkState {
    next_session: u64,
    sessions: HashMap<String, PendingSession>,
    objects: HashMap<String, Vec<u8>>,
    aborted: Vec<String>,
    completed: Vec<String>,
}

/// A [`MultipartSink`] that assembles objects in memory.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
    fail_begin: bool,
    fail_complete: bool,
    /// Remaining injected failures keyed by part number.
    part_failures: Mutex<HashMap<u32, u32>>,
    /// Added to the real size in `head_object`.
    size_skew: i64,
    digest: Option<DigestAlgorithm>,
    corrupt_digest: bool,
    delay: Option<DelayFn>,
    concurrency: Concurrency,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `begin_session` fail.
    pub fn failing_begin(mut self) -> Self {
        self.fail_begin = true;
        self
    }

    /// Makes `complete_session` fail.
    pub fn failing_complete(mut self) -> Self {
        self.fail_complete = true;
        self
    }

    /// Makes uploads of `part_number` fail `times` times (`u32::MAX` = always).
    pub fn failing_part(self, part_number: u32, times: u32) -> Self {
        self.part_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(part_number, times);
        self
    }

    /// Makes `head_object` misreport the size by `skew` bytes.
    pub fn with_size_skew(mut self, skew: i64) -> Self {
        self.size_skew = skew;
        self
    }

    /// Makes `head_object` report a digest of the stored object.
    pub fn with_digest(mut self, algorithm: DigestAlgorithm) -> Self {
        self.digest = Some(algorithm);
        self
    }

    /// Makes the reported digest wrong.
    pub fn with_corrupt_digest(mut self) -> Self {
        self.corrupt_digest = true;
        self
    }

    /// Delays each part upload by `delay(part_number)`.
    pub fn with_delay(mut self, delay: impl Fn(u64) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Some(Box::new(delay));
        self
    }

    /// Bytes of a committed object.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(key).cloned()
    }

    /// Ids of sessions that are still open.
    pub fn open_sessions(&self) -> Vec<String> {
        self.lock().sessions.keys().cloned().collect()
    }

    /// Ids of sessions that were aborted.
    pub fn aborted_sessions(&self) -> Vec<String> {
        self.lock().aborted.clone()
    }

    /// Ids of sessions that were committed.
    pub fn completed_sessions(&self) -> Vec<String> {
        self.lock().completed.clone()
    }

    /// Total sessions ever opened.
    pub fn sessions_opened(&self) -> u64 {
        self.lock().next_session
    }

    /// Highest number of part uploads observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.concurrency.peak.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn assemble(
        session: &PendingSession,
        parts: &[UploadPart],
    ) -> Result<Vec<u8>, TransferError> {
        if parts.len() != session.parts.len() {
            return Err(TransferError::DestinationUpload(format!(
                "commit lists {} parts, session holds {}",
                parts.len(),
                session.parts.len()
            )));
        }
        let mut object = Vec::new();
        for (expected, part) in (1u32..).zip(parts) {
            if part.part_number != expected {
                return Err(TransferError::DestinationUpload(format!(
                    "invalid part order: expected {expected}, got {}",
                    part.part_number
                )));
            }
            let (content_id, data) = session.parts.get(&part.part_number).ok_or_else(|| {
                TransferError::DestinationUpload(format!("unknown part {}", part.part_number))
            })?;
            if *content_id != part.content_id {
                return Err(TransferError::DestinationUpload(format!(
                    "content id mismatch for part {}",
                    part.part_number
                )));
            }
            object.extend_from_slice(data);
        }
        Ok(object)
    }
}

impl MultipartSink for MemorySink {
    fn begin_session<'a>(&'a self, key: &'a str) -> TransferFuture<'a, String> {
        Box::pin(async move {
            if self.fail_begin {
                return Err(TransferError::DestinationUpload(
                    "injected failure opening session".into(),
                ));
            }
            let mut state = self.lock();
            state.next_session += 1;
            let id = format!("session-{}", state.next_session);
            state.sessions.insert(
                id.clone(),
                PendingSession {
                    key: key.to_string(),
                    parts: HashMap::new(),
                },
            );
            Ok(id)
        })
    }

    fn upload_part<'a>(
        &'a self,
        _key: &'a str,
        session_id: &'a str,
        part_number: u32,
        data: Vec<u8>,
    ) -> TransferFuture<'a, String> {
        Box::pin(async move {
            self.concurrency.enter();
            if let Some(delay) = &self.delay {
                tokio::time::sleep(delay(part_number as u64)).await;
            }
            let result = if take_failure(&self.part_failures, &part_number) {
                Err(TransferError::DestinationUpload(format!(
                    "injected failure on part {part_number}"
                )))
            } else {
                let content_id = digest_bytes(DigestAlgorithm::Md5, &data);
                let mut state = self.lock();
                match state.sessions.get_mut(session_id) {
                    Some(session) => {
                        session
                            .parts
                            .insert(part_number, (content_id.clone(), data));
                        Ok(content_id)
                    }
                    None => Err(TransferError::DestinationUpload(format!(
                        "no such session: {session_id}"
                    ))),
                }
            };
            self.concurrency.exit();
            result
        })
    }

    fn complete_session<'a>(
        &'a self,
        key: &'a str,
        session_id: &'a str,
        parts: &'a [UploadPart],
    ) -> TransferFuture<'a, ()> {
        Box::pin(async move {
            if self.fail_complete {
                return Err(TransferError::DestinationUpload(
                    "injected failure completing session".into(),
                ));
            }
            let mut state = self.lock();
            let session = state.sessions.get(session_id).ok_or_else(|| {
                TransferError::DestinationUpload(format!("no such session: {session_id}"))
            })?;
            if session.key != key {
                return Err(TransferError::DestinationUpload(format!(
                    "session {session_id} belongs to {}",
                    session.key
                )));
            }
            let object = Self::assemble(session, parts)?;
            state.sessions.remove(session_id);
            state.objects.insert(key.to_string(), object);
            state.completed.push(session_id.to_string());
            Ok(())
        })
    }

    fn abort_session<'a>(&'a self, _key: &'a str, session_id: &'a str) -> TransferFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.sessions.remove(session_id).is_none() {
                return Err(TransferError::DestinationUpload(format!(
                    "no such session: {session_id}"
                )));
            }
            state.aborted.push(session_id.to_string());
            Ok(())
        })
    }

    fn head_object<'a>(&'a self, key: &'a str) -> TransferFuture<'a, ObjectHead> {
        Box::pin(async move {
            let state = self.lock();
            let object = state
                .objects
                .get(key)
                .ok_or_else(|| TransferError::DestinationUpload(format!("no such key: {key}")))?;
            let size = (object.len() as i64 + self.size_skew).max(0) as u64;
            let digest = self.digest.map(|algorithm| {
                if self.corrupt_digest {
                    digest_bytes(algorithm, b"corrupt")
                } else {
                    digest_bytes(algorithm, object)
                }
            });
            Ok(ObjectHead { size, digest })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn source_serves_ranges() {
        let source = MemorySource::new().with_object("a", b"0123456789".to_vec());
        assert_eq!(source.size("a").await.unwrap(), 10);
        assert_eq!(source.read_range("a", 3, 4).await.unwrap(), b"3456");
        assert_eq!(source.read_count(), 1);
    }

    #[tokio::test]
    async fn source_missing_object() {
        let source = MemorySource::new();
        assert!(matches!(
            source.size("nope").await,
            Err(TransferError::SourceRead(_))
        ));
    }

    #[tokio::test]
    async fn source_injected_failure_is_consumed() {
        let source = MemorySource::new()
            .with_object("a", b"0123456789".to_vec())
            .failing_read(0, 1);
        assert!(source.read_range("a", 0, 5).await.is_err());
        assert_eq!(source.read_range("a", 0, 5).await.unwrap(), b"01234");
    }

    #[tokio::test]
    async fn source_short_read() {
        let source = MemorySource::new()
            .with_object("a", b"0123456789".to_vec())
            .short_read(5);
        assert_eq!(source.read_range("a", 5, 5).await.unwrap(), b"5678");
    }

    #[tokio::test]
    async fn sink_assembles_parts_in_order() {
        let sink = MemorySink::new();
        let id = sink.begin_session("k").await.unwrap();
        let e2 = sink.upload_part("k", &id, 2, b"world".to_vec()).await.unwrap();
        let e1 = sink.upload_part("k", &id, 1, b"hello ".to_vec()).await.unwrap();
        let parts = vec![
            UploadPart {
                part_number: 1,
                content_id: e1,
            },
            UploadPart {
                part_number: 2,
                content_id: e2,
            },
        ];
        sink.complete_session("k", &id, &parts).await.unwrap();

        assert_eq!(sink.object("k").unwrap(), b"hello world");
        assert!(sink.open_sessions().is_empty());
        assert_eq!(sink.head_object("k").await.unwrap().size, 11);
    }

    #[tokio::test]
    async fn sink_rejects_unordered_commit() {
        let sink = MemorySink::new();
        let id = sink.begin_session("k").await.unwrap();
        let e1 = sink.upload_part("k", &id, 1, b"a".to_vec()).await.unwrap();
        let e2 = sink.upload_part("k", &id, 2, b"b".to_vec()).await.unwrap();
        let parts = vec![
            UploadPart {
                part_number: 2,
                content_id: e2,
            },
            UploadPart {
                part_number: 1,
                content_id: e1,
            },
        ];
        assert!(sink.complete_session("k", &id, &parts).await.is_err());
    }

    #[tokio::test]
    async fn sink_abort_discards_session() {
        let sink = MemorySink::new();
        let id = sink.begin_session("k").await.unwrap();
        sink.upload_part("k", &id, 1, b"a".to_vec()).await.unwrap();
        sink.abort_session("k", &id).await.unwrap();
        assert!(sink.open_sessions().is_empty());
        assert_eq!(sink.aborted_sessions(), vec![id]);
        assert!(sink.head_object("k").await.is_err());
    }

    #[tokio::test]
    async fn sink_reports_skewed_size_and_digest() {
        let sink = MemorySink::new()
            .with_size_skew(-1)
            .with_digest(DigestAlgorithm::Md5);
        let id = sink.begin_session("k").await.unwrap();
        let e1 = sink.upload_part("k", &id, 1, b"hello world".to_vec()).await.unwrap();
        sink.complete_session(
            "k",
            &id,
            &[UploadPart {
                part_number: 1,
                content_id: e1,
            }],
        )
        .await
        .unwrap();

        let head = sink.head_object("k").await.unwrap();
        assert_eq!(head.size, 10);
        assert_eq!(
            head.digest.as_deref(),
            Some("5eb63bbbe01eeed093cb22bb8f5acdc3")
        );
    }
}
