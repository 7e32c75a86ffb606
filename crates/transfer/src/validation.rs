use crate::error::TransferError;
use crate::types::{TransferJob, TransferOptions};

/// Longest destination key accepted, in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Validates a destination object key.
///
/// Rejects:
/// - Empty keys
/// - Keys longer than [`MAX_KEY_LEN`] bytes
/// - Absolute keys (leading `/`)
/// - Parent directory segments (`..`)
/// - Control characters
pub fn validate_destination_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(TransferError::Configuration(
            "destination key is empty".into(),
        ));
    }

    if key.len() > MAX_KEY_LEN {
        return Err(TransferError::Configuration(format!(
            "destination key is {} bytes, limit is {MAX_KEY_LEN}",
            key.len()
        )));
    }

    if key.starts_with('/') {
        return Err(TransferError::Configuration(format!(
            "absolute destination key not allowed: {key}"
        )));
    }

    if key.split('/').any(|segment| segment == "..") {
        return Err(TransferError::Configuration(format!(
            "parent directory segment not allowed: {key}"
        )));
    }

    if key.chars().any(char::is_control) {
        return Err(TransferError::Configuration(format!(
            "control character in destination key: {key:?}"
        )));
    }

    Ok(())
}

/// Checks a job against the effective options before any I/O happens.
pub fn validate_job(job: &TransferJob, options: &TransferOptions) -> Result<(), TransferError> {
    if job.source().trim().is_empty() {
        return Err(TransferError::Configuration(
            "source object name is empty".into(),
        ));
    }

    validate_destination_key(job.destination_key())?;

    if job.workers(options) == 0 {
        return Err(TransferError::Configuration(
            "worker count must be at least 1".into(),
        ));
    }

    if job.chunk_size(options) == 0 {
        return Err(TransferError::Configuration(
            "chunk size must be at least 1 byte".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(key: &str) -> bool {
        matches!(
            validate_destination_key(key),
            Err(TransferError::Configuration(_))
        )
    }

    #[test]
    fn rejects_empty_key() {
        assert!(rejected(""));
    }

    #[test]
    fn rejects_parent_segment() {
        assert!(rejected("../escape.bin"));
        assert!(rejected("data/../../escape.bin"));
        assert!(rejected(".."));
    }

    #[test]
    fn rejects_absolute_key() {
        assert!(rejected("/etc/passwd"));
    }

    #[test]
    fn rejects_control_characters() {
        assert!(rejected("bad\nkey"));
        assert!(rejected("nul\0"));
    }

    #[test]
    fn rejects_oversized_key() {
        assert!(rejected(&"k".repeat(MAX_KEY_LEN + 1)));
        assert!(!rejected(&"k".repeat(MAX_KEY_LEN)));
    }

    #[test]
    fn accepts_plain_and_nested_keys() {
        assert!(validate_destination_key("backup.tar").is_ok());
        assert!(validate_destination_key("2024/05/backup.tar").is_ok());
        assert!(validate_destination_key(".hidden/file").is_ok());
    }

    #[test]
    fn dots_inside_segment_are_fine() {
        assert!(validate_destination_key("archive..old/file").is_ok());
        assert!(validate_destination_key("a/.../b").is_ok());
    }

    #[test]
    fn job_requires_source() {
        let job = TransferJob::new("  ", "dest");
        assert!(validate_job(&job, &TransferOptions::default()).is_err());
    }

    #[test]
    fn job_rejects_zero_workers() {
        let job = TransferJob::new("src", "dest").with_workers(0);
        assert!(matches!(
            validate_job(&job, &TransferOptions::default()),
            Err(TransferError::Configuration(_))
        ));
    }

    #[test]
    fn job_rejects_zero_chunk_size_from_options() {
        let options = TransferOptions {
            chunk_size: 0,
            ..TransferOptions::default()
        };
        let job = TransferJob::new("src", "dest");
        assert!(validate_job(&job, &options).is_err());
        // A per-job override wins.
        assert!(validate_job(&job.with_chunk_size(1), &options).is_ok());
    }

    #[test]
    fn valid_job_passes() {
        let job = TransferJob::new("big.bin", "uploads/big.bin");
        assert!(validate_job(&job, &TransferOptions::default()).is_ok());
    }
}
