//! Statistics tracking for the stream session.
//!
//! Tracks ingest and playback metrics for observability and quality
//! monitoring. Designed to be logged periodically while a session runs.

use std::time::{Duration, Instant};
use tracing::info;

/// Ingest and playback statistics for one listening session.
#[derive(Debug, Clone)]
pub struct StreamStats {
    // ---
    /// Total chunks received from the transport
    pub chunks_received: u64,

    /// Total raw bytes received
    pub bytes_received: u64,

    /// Chunks that yielded a granule position
    pub granule_chunks: u64,

    /// Header/tags pages excluded from timing
    pub metadata_chunks: u64,

    /// PCM blocks handed to the scheduler
    pub blocks_scheduled: u64,

    /// Times the scheduling cursor fell behind the device clock
    pub underruns: u64,

    /// Start time for rate calculations
    start_time: Instant,

    /// Last time stats were logged
    last_log_time: Instant,

    /// Interval between periodic logs
    log_interval: Duration,
}

impl StreamStats {
    // ---
    /// Creates a new stats tracker.
    ///
    /// # Arguments
    ///
    /// * `log_interval` - How often to automatically log stats
    pub fn new(log_interval: Duration) -> Self {
        // ---
        let now = Instant::now();
        Self {
            chunks_received: 0,
            bytes_received: 0,
            granule_chunks: 0,
            metadata_chunks: 0,
            blocks_scheduled: 0,
            underruns: 0,
            start_time: now,
            last_log_time: now,
            log_interval,
        }
    }

    /// Records a received chunk and what the page probes found in it.
    pub fn record_chunk(&mut self, len: usize, had_granule: bool, was_metadata: bool) {
        // ---
        self.chunks_received += 1;
        self.bytes_received += len as u64;

        if had_granule {
            self.granule_chunks += 1;
        }
        if was_metadata {
            self.metadata_chunks += 1;
        }

        // Periodic logging
        self.maybe_log();
    }

    /// Records a block handed to the scheduler.
    pub fn record_block(&mut self, underrun: bool) {
        // ---
        self.blocks_scheduled += 1;
        if underrun {
            self.underruns += 1;
        }
    }

    /// Calculates chunks per second reception rate.
    pub fn chunks_per_second(&self) -> f64 {
        // ---
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.chunks_received as f64 / elapsed
        }
    }

    /// Fraction of chunks that carried usable timing, as a percentage.
    pub fn granule_percentage(&self) -> f64 {
        // ---
        if self.chunks_received == 0 {
            0.0
        } else {
            (self.granule_chunks as f64 / self.chunks_received as f64) * 100.0
        }
    }

    /// Returns runtime duration.
    pub fn runtime(&self) -> Duration {
        // ---
        self.start_time.elapsed()
    }

    /// Logs statistics if interval has elapsed.
    fn maybe_log(&mut self) {
        // ---
        if self.last_log_time.elapsed() >= self.log_interval {
            self.log();
            self.last_log_time = Instant::now();
        }
    }

    /// Force log current statistics.
    pub fn log(&self) {
        // ---
        info!(
            "Stream stats: {} chunks ({:.2} chunk/s, {} bytes), {:.1}% timed, {} metadata, {} blocks, {} underruns",
            self.chunks_received,
            self.chunks_per_second(),
            self.bytes_received,
            self.granule_percentage(),
            self.metadata_chunks,
            self.blocks_scheduled,
            self.underruns
        );
    }
}

impl Default for StreamStats {
    fn default() -> Self {
        // ---
        Self::new(Duration::from_secs(5))
    }
}
