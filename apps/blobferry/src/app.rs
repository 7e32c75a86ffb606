//! Wires configuration, backends and the orchestrator for one run.

use std::sync::Arc;

use anyhow::Context;
use blobferry_backends::{DirectorySink, HttpRangeSource};
use blobferry_transfer::{
    DigestAlgorithm, MultipartSink, ObjectSource, TransferEvent, TransferJob, TransferOptions,
    TransferOrchestrator, TransferOutcome, VerifyMode,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::Config;

/// Per-invocation arguments of `transfer`.
pub struct TransferArgs {
    pub object: String,
    pub key: Option<String>,
    pub workers: Option<usize>,
    pub chunk_size: Option<u64>,
    pub strict: bool,
    pub digest: Option<DigestAlgorithm>,
    pub json: bool,
}

/// Runs one transfer and prints its outcome. Returns whether it succeeded.
pub async fn run(config: Config, args: TransferArgs) -> anyhow::Result<bool> {
    let source_url = config
        .source_url
        .as_deref()
        .context("no source URL configured (set source_url or BLOBFERRY_SOURCE_URL)")?;
    let dest_dir = config
        .dest_dir
        .clone()
        .context("no destination directory configured (set dest_dir or BLOBFERRY_DEST_DIR)")?;

    let mut options = config.transfer_options();
    if args.strict {
        options.verify = VerifyMode::Strict;
    }
    if let Some(digest) = args.digest {
        options.digest = digest;
    }

    let source = HttpRangeSource::new(source_url, config.http_timeouts())?;
    let mut sink = DirectorySink::new(dest_dir);
    if options.verify == VerifyMode::Strict {
        sink = sink.with_digest(options.digest);
    }

    let outcome = transfer(Arc::new(source), Arc::new(sink), options, &job_for(&args)).await;
    print_outcome(&outcome, args.json)?;
    Ok(outcome.success)
}

fn job_for(args: &TransferArgs) -> TransferJob {
    let key = args.key.as_deref().unwrap_or(&args.object);
    let mut job = TransferJob::new(args.object.as_str(), key);
    if let Some(workers) = args.workers {
        job = job.with_workers(workers);
    }
    if let Some(chunk_size) = args.chunk_size {
        job = job.with_chunk_size(chunk_size);
    }
    job
}

/// Runs `job` against the given collaborators.
pub async fn transfer(
    source: Arc<dyn ObjectSource>,
    sink: Arc<dyn MultipartSink>,
    options: TransferOptions,
    job: &TransferJob,
) -> TransferOutcome {
    let mut orchestrator = TransferOrchestrator::new(source, sink, options);
    let reporter = orchestrator.take_events().map(|rx| tokio::spawn(report_events(rx)));

    let outcome = orchestrator.execute(job).await;

    // Dropping the orchestrator closes the channel and ends the reporter.
    drop(orchestrator);
    if let Some(handle) = reporter {
        let _ = handle.await;
    }
    outcome
}

async fn report_events(mut rx: mpsc::Receiver<TransferEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            TransferEvent::StateChanged(state) => match state.phase() {
                Some(phase) => info!(%phase, "phase started"),
                None => debug!(?state, "state changed"),
            },
            TransferEvent::Progress {
                phase,
                completed,
                total,
                bytes_per_second,
            } => debug!(
                %phase,
                completed,
                total,
                mib_per_second = bytes_per_second / (1024.0 * 1024.0),
                "throughput"
            ),
            TransferEvent::Succeeded { size } => info!(size, "done"),
            TransferEvent::Failed { phase, error } => debug!(%phase, %error, "job failed"),
        }
    }
}

fn print_outcome(outcome: &TransferOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else if outcome.success {
        println!("{}", outcome.message);
    } else {
        eprintln!("{}", outcome.message);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobferry_transfer::{MemorySource, Phase, RetryPolicy};

    fn args(object: &str) -> TransferArgs {
        TransferArgs {
            object: object.into(),
            key: None,
            workers: None,
            chunk_size: None,
            strict: false,
            digest: None,
            json: false,
        }
    }

    fn options(staging: &tempfile::TempDir) -> TransferOptions {
        TransferOptions {
            workers: 3,
            chunk_size: 64,
            retry: RetryPolicy::none(),
            staging_dir: Some(staging.path().to_path_buf()),
            ..TransferOptions::default()
        }
    }

    #[test]
    fn key_defaults_to_object_name() {
        let job = job_for(&args("videos/a.mp4"));
        assert_eq!(job.destination_key(), "videos/a.mp4");
        assert_eq!(job.workers_override(), None);

        let job = job_for(&TransferArgs {
            key: Some("b.mp4".into()),
            workers: Some(2),
            chunk_size: Some(128),
            ..args("a.mp4")
        });
        assert_eq!(job.destination_key(), "b.mp4");
        assert_eq!(job.workers_override(), Some(2));
        assert_eq!(job.chunk_size_override(), Some(128));
    }

    #[tokio::test]
    async fn copies_into_directory_store() {
        let staging = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let source = Arc::new(MemorySource::new().with_object("in.bin", data.clone()));
        let sink = Arc::new(DirectorySink::new(dest.path()).with_digest(DigestAlgorithm::Md5));
        let opts = TransferOptions {
            verify: VerifyMode::Strict,
            ..options(&staging)
        };

        let outcome = transfer(source, sink, opts, &TransferJob::new("in.bin", "out/in.bin")).await;

        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.size, Some(1000));
        assert_eq!(std::fs::read(dest.path().join("out/in.bin")).unwrap(), data);
        assert!(std::fs::read_dir(staging.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn failure_outcome_names_phase() {
        let staging = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let source = Arc::new(MemorySource::new());
        let sink = Arc::new(DirectorySink::new(dest.path()));

        let outcome =
            transfer(source, sink, options(&staging), &TransferJob::new("missing", "k")).await;

        assert!(!outcome.success);
        assert_eq!(outcome.failed_phase, Some(Phase::Download));
        assert!(outcome.size.is_none());
    }

    #[tokio::test]
    async fn requires_source_url() {
        let config = Config {
            dest_dir: Some("/tmp".into()),
            ..Config::default()
        };
        let err = run(config, args("x")).await.unwrap_err();
        assert!(err.to_string().contains("source URL"));
    }

    #[tokio::test]
    async fn requires_dest_dir() {
        let config = Config {
            source_url: Some("http://127.0.0.1:1/c".into()),
            ..Config::default()
        };
        let err = run(config, args("x")).await.unwrap_err();
        assert!(err.to_string().contains("destination directory"));
    }

    #[test]
    fn outcome_json_shape() {
        let outcome = TransferOutcome {
            success: true,
            message: "ok".into(),
            size: Some(5),
            digest: Some("abc".into()),
            failed_phase: None,
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&outcome).unwrap()).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["size"], 5);
        assert!(value.get("failed_phase").is_none());
    }
}
