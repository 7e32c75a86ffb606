//! Local staging file that chunks land in before upload.
//!
//! The file is pre-sized to the object length before any write. Download
//! workers write through their own [`StagingWriter`] handle at their chunk's
//! offset; ranges never overlap, so no lock is shared between writers. The
//! upload phase reads it back sequentially through a [`PartReader`].

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempPath;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::digest::{DigestAlgorithm, hash_file};
use crate::error::TransferError;
use crate::plan::ChunkRange;

/// A pre-allocated temp file of exactly `len` bytes.
///
/// Removed from disk when released or dropped, whichever comes first.
pub struct StagingBuffer {
    path: Option<TempPath>,
    location: Arc<PathBuf>,
    len: u64,
}

impl StagingBuffer {
    /// Creates a staging file of `len` bytes in `dir` (system temp dir if `None`).
    pub async fn allocate(dir: Option<&Path>, len: u64) -> Result<Self, TransferError> {
        let dir = dir
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);

        let path = tokio::task::spawn_blocking(move || -> std::io::Result<TempPath> {
            std::fs::create_dir_all(&dir)?;
            let file = tempfile::Builder::new()
                .prefix("blobferry-")
                .suffix(".staging")
                .tempfile_in(&dir)?;
            file.as_file().set_len(len)?;
            Ok(file.into_temp_path())
        })
        .await?
        .map_err(|e| TransferError::StagingWrite(format!("allocate staging file: {e}")))?;

        debug!(path = %path.display(), len, "staging file allocated");
        let location = Arc::new(path.to_path_buf());
        Ok(Self {
            path: Some(path),
            location,
            len,
        })
    }

    /// Path of the staging file.
    pub fn path(&self) -> &Path {
        &self.location
    }

    /// Size of the staging region in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a cloneable handle for positional writes.
    pub fn writer(&self) -> StagingWriter {
        StagingWriter {
            path: Arc::clone(&self.location),
            len: self.len,
        }
    }

    /// Opens a sequential reader that yields numbered parts of `part_size` bytes.
    pub async fn part_reader(&self, part_size: u64) -> Result<PartReader, TransferError> {
        PartReader::open(&self.location, part_size).await
    }

    /// Digest of the staged content.
    ///
    /// Fails with [`TransferError::StagingRead`] if the file no longer holds
    /// exactly `len` bytes.
    pub async fn digest(&self, algorithm: DigestAlgorithm) -> Result<String, TransferError> {
        let path = Arc::clone(&self.location);
        let len = self.len;
        tokio::task::spawn_blocking(move || {
            let (digest, hashed) = hash_file(algorithm, &path)?;
            if hashed != len {
                return Err(TransferError::StagingRead(format!(
                    "{}: hashed {hashed} bytes, staged {len}",
                    path.display()
                )));
            }
            Ok(digest)
        })
        .await?
    }

    /// Deletes the staging file.
    pub fn release(mut self) -> Result<(), TransferError> {
        match self.path.take() {
            Some(path) => {
                let shown = path.display().to_string();
                path.close().map_err(|e| {
                    TransferError::StagingWrite(format!("remove staging file {shown}: {e}"))
                })?;
                debug!(path = %shown, "staging file removed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Write handle onto a [`StagingBuffer`].
///
/// Each call opens its own file handle, so concurrent writers to disjoint
/// ranges never contend on a shared lock.
#[derive(Debug, Clone)]
pub struct StagingWriter {
    path: Arc<PathBuf>,
    len: u64,
}

impl StagingWriter {
    /// Writes `data` at `range.start`. `data` must cover the range exactly.
    pub async fn write_chunk(&self, range: &ChunkRange, data: &[u8]) -> Result<(), TransferError> {
        if range.end_inclusive >= self.len {
            return Err(TransferError::StagingWrite(format!(
                "chunk {} ends at {} beyond staging size {}",
                range.index, range.end_inclusive, self.len
            )));
        }
        if data.len() as u64 != range.len() {
            return Err(TransferError::StagingWrite(format!(
                "chunk {} has {} bytes, range needs {}",
                range.index,
                data.len(),
                range.len()
            )));
        }

        let staging_write =
            |e: std::io::Error| TransferError::StagingWrite(format!("chunk {}: {e}", range.index));

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.path.as_path())
            .await
            .map_err(staging_write)?;
        file.seek(SeekFrom::Start(range.start))
            .await
            .map_err(staging_write)?;
        file.write_all(data).await.map_err(staging_write)?;
        file.flush().await.map_err(staging_write)?;
        Ok(())
    }
}

/// Reads a staged file sequentially in fixed-size, 1-based numbered parts.
///
/// The file size is taken from the file itself, not from the download plan.
pub struct PartReader {
    file: tokio::fs::File,
    part_size: u64,
    offset: u64,
    file_size: u64,
    next_part_number: u32,
}

impl PartReader {
    /// Opens `path` for part reading.
    pub async fn open(path: &Path, part_size: u64) -> Result<Self, TransferError> {
        if part_size == 0 {
            return Err(TransferError::Configuration(
                "part size must be non-zero".into(),
            ));
        }
        let staging_read =
            |e: std::io::Error| TransferError::StagingRead(format!("{}: {e}", path.display()));

        let file = tokio::fs::File::open(path).await.map_err(staging_read)?;
        let file_size = file.metadata().await.map_err(staging_read)?.len();
        Ok(Self {
            file,
            part_size,
            offset: 0,
            file_size,
            next_part_number: 1,
        })
    }

    /// Reads the next part. Returns `None` at EOF.
    pub async fn next_part(&mut self) -> Result<Option<(u32, Vec<u8>)>, TransferError> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(None);
        }

        let read_size = remaining.min(self.part_size) as usize;
        let mut buf = vec![0u8; read_size];
        self.file.read_exact(&mut buf).await.map_err(|e| {
            TransferError::StagingRead(format!(
                "part {} at offset {}: {e}",
                self.next_part_number, self.offset
            ))
        })?;

        let part_number = self.next_part_number;
        self.offset += read_size as u64;
        self.next_part_number += 1;
        Ok(Some((part_number, buf)))
    }

    /// Number of parts this reader will yield in total.
    pub fn part_count(&self) -> usize {
        self.file_size.div_ceil(self.part_size) as usize
    }

    /// Bytes remaining to read.
    pub fn remaining(&self) -> u64 {
        self.file_size - self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::plan_chunks;

    #[tokio::test]
    async fn allocate_presizes_file() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingBuffer::allocate(Some(dir.path()), 1234).await.unwrap();
        let meta = std::fs::metadata(staging.path()).unwrap();
        assert_eq!(meta.len(), 1234);
        assert_eq!(staging.len(), 1234);
    }

    #[tokio::test]
    async fn release_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingBuffer::allocate(Some(dir.path()), 16).await.unwrap();
        let path = staging.path().to_path_buf();
        assert!(path.exists());
        staging.release().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let staging = StagingBuffer::allocate(Some(dir.path()), 16).await.unwrap();
            staging.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn writes_land_at_offsets_in_any_order() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"The quick brown fox jumps over the lazy dog";
        let staging = StagingBuffer::allocate(Some(dir.path()), data.len() as u64)
            .await
            .unwrap();
        let writer = staging.writer();

        let ranges = plan_chunks(data.len() as u64, 10);
        for range in ranges.iter().rev() {
            let slice = &data[range.start as usize..=range.end_inclusive as usize];
            writer.write_chunk(range, slice).await.unwrap();
        }

        let content = std::fs::read(staging.path()).unwrap();
        assert_eq!(&content, data);
    }

    #[tokio::test]
    async fn concurrent_disjoint_writes() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 253) as u8).collect();
        let staging = StagingBuffer::allocate(Some(dir.path()), data.len() as u64)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for range in plan_chunks(data.len() as u64, 100) {
            let writer = staging.writer();
            let slice = data[range.start as usize..=range.end_inclusive as usize].to_vec();
            handles.push(tokio::spawn(async move {
                writer.write_chunk(&range, &slice).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(std::fs::read(staging.path()).unwrap(), data);
    }

    #[tokio::test]
    async fn write_rejects_out_of_bounds_range() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingBuffer::allocate(Some(dir.path()), 8).await.unwrap();
        let range = ChunkRange {
            index: 0,
            start: 4,
            end_inclusive: 11,
        };
        let err = staging.writer().write_chunk(&range, &[0u8; 8]).await.unwrap_err();
        assert!(matches!(err, TransferError::StagingWrite(_)));
    }

    #[tokio::test]
    async fn write_rejects_length_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingBuffer::allocate(Some(dir.path()), 8).await.unwrap();
        let range = ChunkRange {
            index: 0,
            start: 0,
            end_inclusive: 7,
        };
        let err = staging.writer().write_chunk(&range, &[0u8; 3]).await.unwrap_err();
        assert!(matches!(err, TransferError::StagingWrite(_)));
    }

    #[tokio::test]
    async fn digest_covers_staged_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingBuffer::allocate(Some(dir.path()), 11).await.unwrap();
        std::fs::write(staging.path(), b"hello world").unwrap();

        assert_eq!(
            staging.digest(DigestAlgorithm::Md5).await.unwrap(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[tokio::test]
    async fn digest_rejects_resized_file() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingBuffer::allocate(Some(dir.path()), 16).await.unwrap();
        std::fs::OpenOptions::new()
            .write(true)
            .open(staging.path())
            .unwrap()
            .set_len(20)
            .unwrap();

        let err = staging.digest(DigestAlgorithm::Md5).await.unwrap_err();
        assert!(matches!(err, TransferError::StagingRead(_)), "{err:?}");
    }

    #[tokio::test]
    async fn digest_of_removed_file_is_staging_read() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingBuffer::allocate(Some(dir.path()), 4).await.unwrap();
        std::fs::remove_file(staging.path()).unwrap();

        let err = staging.digest(DigestAlgorithm::Sha256).await.unwrap_err();
        assert!(matches!(err, TransferError::StagingRead(_)), "{err:?}");
    }

    #[tokio::test]
    async fn part_reader_numbers_parts_from_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staged.bin");
        std::fs::write(&path, b"AABBCCDDEE").unwrap();

        let mut reader = PartReader::open(&path, 4).await.unwrap();
        assert_eq!(reader.remaining(), 10);
        assert_eq!(reader.part_count(), 3);

        let (n1, p1) = reader.next_part().await.unwrap().unwrap();
        assert_eq!((n1, p1.as_slice()), (1, &b"AABB"[..]));
        assert_eq!(reader.remaining(), 6);

        let (n2, p2) = reader.next_part().await.unwrap().unwrap();
        assert_eq!((n2, p2.as_slice()), (2, &b"CCDD"[..]));

        let (n3, p3) = reader.next_part().await.unwrap().unwrap();
        assert_eq!((n3, p3.as_slice()), (3, &b"EE"[..]));

        assert!(reader.next_part().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn part_reader_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let mut reader = PartReader::open(&path, 4).await.unwrap();
        assert_eq!(reader.part_count(), 0);
        assert!(reader.next_part().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn part_reader_rejects_zero_part_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(
            PartReader::open(&path, 0).await,
            Err(TransferError::Configuration(_))
        ));
    }
}
