//! Stream session: one playback attempt end to end.
//!
//! Per received chunk, in fixed order: probe the raw bytes for timing,
//! decode, push the audible position into the clock, then schedule the PCM.
//! The loop ends normally on end-of-stream or cancellation; any other
//! failure is returned to the supervisor, which decides about reconnecting.

use anyhow::Result;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use live_player_common::MetricsContext;

use crate::clock::SharedClock;
use crate::codec::ChunkDecoder;
use crate::ogg;
use crate::scheduler::AudioScheduler;
use crate::stats::StreamStats;
use crate::transport::ChunkSource;

/// How a session attempt ended, short of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    // ---
    /// The transport signalled end-of-data.
    EndOfStream,

    /// The user stopped playback. Never triggers reconnection.
    Cancelled,
}

/// One decode/schedule attempt over one transport connection.
///
/// The session owns its decoder; the codec resource is released exactly
/// once, when the session value drops, on every exit path.
pub struct StreamSession {
    // ---
    decoder: Box<dyn ChunkDecoder>,
    scheduler: AudioScheduler,
    clock: SharedClock,
    cancel: CancellationToken,
    stats: StreamStats,
    metrics: Option<MetricsContext>,
}

impl StreamSession {
    // ---
    pub fn new(
        decoder: Box<dyn ChunkDecoder>,
        scheduler: AudioScheduler,
        clock: SharedClock,
        cancel: CancellationToken,
    ) -> Self {
        // ---
        Self {
            decoder,
            scheduler,
            clock,
            cancel,
            stats: StreamStats::default(),
            metrics: None,
        }
    }

    /// Attaches a metrics context for hot-path instrumentation.
    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        // ---
        self.metrics = Some(metrics);
        self
    }

    /// Drives the session until end-of-stream, cancellation, or failure.
    ///
    /// Cancellation is cooperative: the token is checked once per chunk
    /// iteration, and a request that races a pending read wins the race.
    ///
    /// # Errors
    ///
    /// Returns error on transport or decode failure; the caller routes
    /// those to the reconnection policy.
    pub async fn run<S: ChunkSource + ?Sized>(mut self, source: &mut S) -> Result<SessionEnd> {
        // ---
        loop {
            let chunk = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("Session cancelled after {:.1}s", self.stats.runtime().as_secs_f64());
                    self.stats.log();
                    return Ok(SessionEnd::Cancelled);
                }

                chunk = source.next_chunk() => chunk?,
            };

            let Some(chunk) = chunk else {
                info!("Stream ended after {:.1}s", self.stats.runtime().as_secs_f64());
                self.stats.log();
                return Ok(SessionEnd::EndOfStream);
            };

            self.handle_chunk(&chunk)?;
        }
    }

    /// Processes one received chunk.
    ///
    /// The clock update deliberately uses the scheduling lead as it stands
    /// before this chunk's own audio is placed; the position must reflect
    /// what is audible, not what is about to be queued.
    fn handle_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        // ---
        let granule = ogg::granule_position(chunk);
        let metadata_page = ogg::is_metadata_page(chunk);

        self.stats
            .record_chunk(chunk.len(), granule.is_some(), metadata_page);
        if let Some(metrics) = &self.metrics {
            metrics.chunks_received_total.inc();
            metrics.bytes_received_total.inc_by(chunk.len() as u64);
            if granule.is_some() {
                metrics.granule_pages_total.inc();
            }
            if metadata_page {
                metrics.metadata_pages_total.inc();
            }
        }

        let decode_started = Instant::now();
        let decoded = self.decoder.decode(chunk)?;
        if let Some(metrics) = &self.metrics {
            metrics
                .decode_seconds
                .observe(decode_started.elapsed().as_secs_f64());
        }

        if !metadata_page {
            if let (Some(granule), Some(rate)) = (granule, decoded.sample_rate) {
                let lead_ms = self.scheduler.lead_ms();
                let latency_ms = lead_ms.max(self.clock.buffer_hint_ms());
                let position_ms =
                    (granule as f64 / rate as f64 * 1000.0).round() as i64 - latency_ms;
                self.clock.update_from_decode(position_ms);
            }
        }

        if decoded.is_audible() {
            let outcome = self.scheduler.schedule(&decoded)?;
            self.stats.record_block(outcome.underrun);

            if let Some(metrics) = &self.metrics {
                metrics.blocks_scheduled_total.inc();
                if outcome.underrun {
                    metrics.scheduler_underruns_total.inc();
                }
                metrics
                    .schedule_lead_seconds
                    .observe((self.scheduler.lead_ms().max(0) as f64) / 1000.0);
            }
        }

        Ok(())
    }
}
