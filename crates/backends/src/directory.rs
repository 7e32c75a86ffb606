//! Multipart object store on the local filesystem.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<key>                       committed objects
//! <root>/.sessions/<id>/key          destination key of an open session
//! <root>/.sessions/<id>/part-NNNNNNNN  uploaded parts
//! ```
//!
//! Completing a session concatenates its parts into a temp file next to the
//! object and renames it into place, so readers never see a partial object.

use std::path::{Path, PathBuf};

use blobferry_transfer::digest::{compute_digest, digest_bytes};
use blobferry_transfer::source::TransferFuture;
use blobferry_transfer::{
    DigestAlgorithm, MultipartSink, ObjectHead, TransferError, UploadPart,
    validate_destination_key,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::BackendError;

const SESSIONS_DIR: &str = ".sessions";

/// A [`MultipartSink`] that stores objects as files under a root directory.
pub struct DirectorySink {
    root: PathBuf,
    digest: Option<DigestAlgorithm>,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            digest: None,
        }
    }

    /// Makes `head_object` report a content digest computed with `algorithm`.
    pub fn with_digest(mut self, algorithm: DigestAlgorithm) -> Self {
        self.digest = Some(algorithm);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the committed object for `key`.
    pub fn object_path(&self, key: &str) -> Result<PathBuf, TransferError> {
        validate_destination_key(key)?;
        if key.split('/').next() == Some(SESSIONS_DIR) {
            return Err(TransferError::Configuration(format!(
                "key collides with session storage: {key}"
            )));
        }
        Ok(self.root.join(key))
    }

    /// Ids of sessions that were opened and neither completed nor aborted.
    pub async fn open_sessions(&self) -> Result<Vec<String>, BackendError> {
        let dir = self.root.join(SESSIONS_DIR);
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(BackendError::io("list sessions")(e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(BackendError::io("list sessions"))?
        {
            ids.push(entry.file_name().to_string_lossy().into_owned());
        }
        ids.sort();
        Ok(ids)
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, BackendError> {
        // Ids are minted here as UUIDs; anything else is not ours.
        uuid::Uuid::parse_str(session_id)
            .map_err(|_| BackendError::UnknownSession(session_id.to_string()))?;
        Ok(self.root.join(SESSIONS_DIR).join(session_id))
    }

    fn part_path(session_dir: &Path, part_number: u32) -> PathBuf {
        session_dir.join(format!("part-{part_number:08}"))
    }

    /// Returns the session directory after checking it exists and belongs to `key`.
    async fn open_session(&self, key: &str, session_id: &str) -> Result<PathBuf, BackendError> {
        let dir = self.session_dir(session_id)?;
        let owner = match tokio::fs::read_to_string(dir.join("key")).await {
            Ok(owner) => owner,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::UnknownSession(session_id.to_string()));
            }
            Err(e) => return Err(BackendError::io(format!("read session {session_id}"))(e)),
        };
        if owner != key {
            return Err(BackendError::UnknownSession(format!(
                "{session_id} (belongs to {owner})"
            )));
        }
        Ok(dir)
    }

    async fn begin(&self, key: &str) -> Result<String, BackendError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let dir = self.session_dir(&session_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(BackendError::io(format!("create session {session_id}")))?;
        tokio::fs::write(dir.join("key"), key)
            .await
            .map_err(BackendError::io(format!("create session {session_id}")))?;
        debug!(key, session = %session_id, "session created");
        Ok(session_id)
    }

    async fn put_part(
        &self,
        key: &str,
        session_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> Result<String, BackendError> {
        if part_number == 0 {
            return Err(BackendError::InvalidParts("part numbers start at 1".into()));
        }
        let dir = self.open_session(key, session_id).await?;
        let path = Self::part_path(&dir, part_number);
        let tmp = path.with_extension("tmp");
        let context = format!("write part {part_number}");

        tokio::fs::write(&tmp, data)
            .await
            .map_err(BackendError::io(context.clone()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(BackendError::io(context))?;

        Ok(digest_bytes(DigestAlgorithm::Md5, data))
    }

    async fn complete(
        &self,
        key: &str,
        session_id: &str,
        parts: &[UploadPart],
    ) -> Result<(), BackendError> {
        let dir = self.open_session(key, session_id).await?;
        let target = self
            .object_path(key)
            .map_err(|e| BackendError::InvalidParts(e.to_string()))?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(BackendError::io("create object directory"))?;
        }

        let staging = dir.join("assembled");
        let result = assemble(&dir, &staging, parts).await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e);
        }

        tokio::fs::rename(&staging, &target)
            .await
            .map_err(BackendError::io(format!("publish {key}")))?;
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(BackendError::io(format!("remove session {session_id}")))?;

        info!(key, session = %session_id, parts = parts.len(), "object committed");
        Ok(())
    }

    async fn abort(&self, key: &str, session_id: &str) -> Result<(), BackendError> {
        let dir = self.open_session(key, session_id).await?;
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(BackendError::io(format!("remove session {session_id}")))?;
        debug!(key, session = %session_id, "session removed");
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<ObjectHead, TransferError> {
        let path = self.object_path(key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| BackendError::io(format!("stat {key}"))(e).into_sink_error())?;
        if !meta.is_file() {
            return Err(TransferError::DestinationUpload(format!("{key} is not an object")));
        }

        let digest = match self.digest {
            Some(algorithm) => Some(compute_digest(algorithm, &path).await?),
            None => None,
        };
        Ok(ObjectHead {
            size: meta.len(),
            digest,
        })
    }
}

/// Concatenates `parts` from `dir` into `out`, checking order and content ids.
async fn assemble(dir: &Path, out: &Path, parts: &[UploadPart]) -> Result<(), BackendError> {
    let mut file = tokio::fs::File::create(out)
        .await
        .map_err(BackendError::io("create assembled object"))?;

    for (expected, part) in (1u32..).zip(parts) {
        if part.part_number != expected {
            return Err(BackendError::InvalidParts(format!(
                "expected part {expected}, got {}",
                part.part_number
            )));
        }
        let path = DirectorySink::part_path(dir, part.part_number);
        let data = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::InvalidParts(format!("part {} was never uploaded", part.part_number))
            } else {
                BackendError::io(format!("read part {}", part.part_number))(e)
            }
        })?;
        if digest_bytes(DigestAlgorithm::Md5, &data) != part.content_id {
            return Err(BackendError::InvalidParts(format!(
                "content id mismatch for part {}",
                part.part_number
            )));
        }
        file.write_all(&data)
            .await
            .map_err(BackendError::io("write assembled object"))?;
    }

    file.flush()
        .await
        .map_err(BackendError::io("write assembled object"))?;
    file.sync_all()
        .await
        .map_err(BackendError::io("sync assembled object"))
}

impl MultipartSink for DirectorySink {
    fn begin_session<'a>(&'a self, key: &'a str) -> TransferFuture<'a, String> {
        Box::pin(async move {
            self.object_path(key)?;
            self.begin(key).await.map_err(BackendError::into_sink_error)
        })
    }

    fn upload_part<'a>(
        &'a self,
        key: &'a str,
        session_id: &'a str,
        part_number: u32,
        data: Vec<u8>,
    ) -> TransferFuture<'a, String> {
        Box::pin(async move {
            self.put_part(key, session_id, part_number, &data)
                .await
                .map_err(BackendError::into_sink_error)
        })
    }

    fn complete_session<'a>(
        &'a self,
        key: &'a str,
        session_id: &'a str,
        parts: &'a [UploadPart],
    ) -> TransferFuture<'a, ()> {
        Box::pin(async move {
            self.complete(key, session_id, parts)
                .await
                .map_err(BackendError::into_sink_error)
        })
    }

    fn abort_session<'a>(&'a self, key: &'a str, session_id: &'a str) -> TransferFuture<'a, ()> {
        Box::pin(async move {
            self.abort(key, session_id)
                .await
                .map_err(BackendError::into_sink_error)
        })
    }

    fn head_object<'a>(&'a self, key: &'a str) -> TransferFuture<'a, ObjectHead> {
        Box::pin(self.head(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn upload(sink: &DirectorySink, key: &str, id: &str, parts: &[&[u8]]) -> Vec<UploadPart> {
        let mut out = Vec::new();
        for (n, data) in (1u32..).zip(parts) {
            let content_id = sink.upload_part(key, id, n, data.to_vec()).await.unwrap();
            out.push(UploadPart {
                part_number: n,
                content_id,
            });
        }
        out
    }

    #[tokio::test]
    async fn commits_parts_in_order() {
        let root = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(root.path());

        let id = sink.begin_session("out/data.bin").await.unwrap();
        let parts = upload(&sink, "out/data.bin", &id, &[b"hello ", b"multipart ", b"world"]).await;
        sink.complete_session("out/data.bin", &id, &parts)
            .await
            .unwrap();

        let content = std::fs::read(root.path().join("out/data.bin")).unwrap();
        assert_eq!(content, b"hello multipart world");
        assert!(sink.open_sessions().await.unwrap().is_empty());

        let head = sink.head_object("out/data.bin").await.unwrap();
        assert_eq!(head.size, 21);
        assert_eq!(head.digest, None);
    }

    #[tokio::test]
    async fn parts_may_arrive_out_of_order() {
        let root = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(root.path());

        let id = sink.begin_session("k").await.unwrap();
        let c2 = sink.upload_part("k", &id, 2, b"BB".to_vec()).await.unwrap();
        let c1 = sink.upload_part("k", &id, 1, b"AA".to_vec()).await.unwrap();
        let parts = vec![
            UploadPart {
                part_number: 1,
                content_id: c1,
            },
            UploadPart {
                part_number: 2,
                content_id: c2,
            },
        ];
        sink.complete_session("k", &id, &parts).await.unwrap();

        assert_eq!(std::fs::read(root.path().join("k")).unwrap(), b"AABB");
    }

    #[tokio::test]
    async fn abort_removes_parts() {
        let root = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(root.path());

        let id = sink.begin_session("k").await.unwrap();
        upload(&sink, "k", &id, &[b"x", b"y"]).await;
        assert_eq!(sink.open_sessions().await.unwrap(), vec![id.clone()]);

        sink.abort_session("k", &id).await.unwrap();

        assert!(sink.open_sessions().await.unwrap().is_empty());
        assert!(!root.path().join("k").exists());
        assert!(sink.abort_session("k", &id).await.is_err());
    }

    #[tokio::test]
    async fn rejects_unordered_part_list() {
        let root = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(root.path());

        let id = sink.begin_session("k").await.unwrap();
        let mut parts = upload(&sink, "k", &id, &[b"a", b"b"]).await;
        parts.reverse();

        let err = sink.complete_session("k", &id, &parts).await.unwrap_err();
        assert!(matches!(err, TransferError::DestinationUpload(_)));
        assert!(!root.path().join("k").exists());
        // The session survives a rejected commit so it can still be aborted.
        sink.abort_session("k", &id).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_missing_part() {
        let root = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(root.path());

        let id = sink.begin_session("k").await.unwrap();
        let mut parts = upload(&sink, "k", &id, &[b"a"]).await;
        parts.push(UploadPart {
            part_number: 2,
            content_id: digest_bytes(DigestAlgorithm::Md5, b"b"),
        });

        let err = sink.complete_session("k", &id, &parts).await.unwrap_err();
        assert!(err.to_string().contains("never uploaded"));
    }

    #[tokio::test]
    async fn rejects_wrong_content_id() {
        let root = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(root.path());

        let id = sink.begin_session("k").await.unwrap();
        let mut parts = upload(&sink, "k", &id, &[b"a"]).await;
        parts[0].content_id = "0".repeat(32);

        let err = sink.complete_session("k", &id, &parts).await.unwrap_err();
        assert!(err.to_string().contains("content id mismatch"));
    }

    #[tokio::test]
    async fn session_is_bound_to_key() {
        let root = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(root.path());

        let id = sink.begin_session("a").await.unwrap();
        let err = sink
            .upload_part("b", &id, 1, b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::DestinationUpload(_)));
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(root.path());

        assert!(sink.abort_session("k", "not-a-session").await.is_err());
        assert!(sink.abort_session("k", "../../etc").await.is_err());
    }

    #[tokio::test]
    async fn head_reports_digest_when_configured() {
        let root = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(root.path()).with_digest(DigestAlgorithm::Md5);

        let id = sink.begin_session("k").await.unwrap();
        let parts = upload(&sink, "k", &id, &[b"hello world"]).await;
        sink.complete_session("k", &id, &parts).await.unwrap();

        let head = sink.head_object("k").await.unwrap();
        assert_eq!(head.size, 11);
        assert_eq!(
            head.digest.as_deref(),
            Some("5eb63bbbe01eeed093cb22bb8f5acdc3")
        );
    }

    #[tokio::test]
    async fn head_of_missing_object_fails() {
        let root = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(root.path());
        assert!(matches!(
            sink.head_object("nope").await,
            Err(TransferError::DestinationUpload(_))
        ));
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let root = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(root.path());

        assert!(matches!(
            sink.begin_session("../outside").await,
            Err(TransferError::Configuration(_))
        ));
        assert!(matches!(
            sink.begin_session(".sessions/x").await,
            Err(TransferError::Configuration(_))
        ));
    }
}
