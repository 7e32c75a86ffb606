use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::info;

use crate::types::{Phase, TransferEvent};

// ---------------------------------------------------------------------------
// PhaseProgress
// ---------------------------------------------------------------------------

/// Counts completed units (chunks or parts) for one phase.
///
/// Logs a percentage after each completion and forwards a
/// [`TransferEvent::Progress`] to the optional event channel.
pub struct PhaseProgress {
    phase: Phase,
    total: usize,
    completed: usize,
    speed: SpeedCalculator,
    events: Option<mpsc::Sender<TransferEvent>>,
}

impl PhaseProgress {
    pub fn new(phase: Phase, total: usize, events: Option<mpsc::Sender<TransferEvent>>) -> Self {
        Self {
            phase,
            total,
            completed: 0,
            speed: SpeedCalculator::new(None, None),
            events,
        }
    }

    /// Records one finished unit of `bytes` bytes.
    pub fn advance(&mut self, bytes: u64) {
        self.completed += 1;
        self.speed.add_sample(bytes);
        let percent = if self.total == 0 {
            100.0
        } else {
            (self.completed as f64 / self.total as f64 * 100.0).min(100.0)
        };
        info!(
            phase = %self.phase,
            completed = self.completed,
            total = self.total,
            "{} progress: {percent:.2}%",
            self.phase
        );

        if let Some(tx) = &self.events {
            // Progress is lossy; never block a phase on a slow consumer.
            let _ = tx.try_send(TransferEvent::Progress {
                phase: self.phase,
                completed: self.completed,
                total: self.total,
                bytes_per_second: self.speed.bytes_per_second(),
            });
        }
    }

    pub fn completed(&self) -> usize {
        self.completed
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    /// Records a sample of `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        if let Some(cutoff) = now.checked_sub(s.window_size) {
            s.samples.retain(|sample| sample.timestamp >= cutoff);
        }

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// Returns 0.0 if fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if s.samples.len() < 2 {
            return 0.0;
        }

        let first = &s.samples[0];
        let last = &s.samples[s.samples.len() - 1];
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        let total_bytes: u64 = s.samples.iter().map(|sample| sample.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }
}
