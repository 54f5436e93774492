//! Playback clock and synthetic ticker.
//!
//! The displayed position blends three sources: decode-derived updates while
//! live, a 100ms synthetic ticker while stopped or retrying, and explicit
//! resyncs from fresh track metadata. The first two are mutually exclusive;
//! the clock carries an explicit source marker so a stale updater cannot
//! fight the active one.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Period of the synthetic ticker.
pub const TICK_PERIOD: Duration = Duration::from_millis(100);

/// Which source currently drives the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// Synthetic ticker advances the position in fixed steps.
    Ticker,

    /// Decode-derived positions from the live session.
    Decode,
}

#[derive(Debug)]
struct PlaybackClock {
    // ---
    position_ms: i64,
    buffer_hint_ms: i64,
    source: ClockSource,
}

/// Cloneable handle to the playback clock.
///
/// Observers subscribe to position changes through a watch channel; the UI
/// layer reads, never writes.
#[derive(Clone)]
pub struct SharedClock {
    // ---
    inner: Arc<Mutex<PlaybackClock>>,
    position_tx: Arc<watch::Sender<i64>>,
}

impl SharedClock {
    // ---
    pub fn new() -> Self {
        // ---
        let (position_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(PlaybackClock {
                position_ms: 0,
                buffer_hint_ms: 0,
                source: ClockSource::Ticker,
            })),
            position_tx: Arc::new(position_tx),
        }
    }

    /// Current position in milliseconds.
    pub fn position_ms(&self) -> i64 {
        // ---
        self.inner.lock().expect("clock lock").position_ms
    }

    /// Configured buffering hint in milliseconds.
    pub fn buffer_hint_ms(&self) -> i64 {
        // ---
        self.inner.lock().expect("clock lock").buffer_hint_ms
    }

    /// The source currently allowed to drive the clock.
    pub fn source(&self) -> ClockSource {
        // ---
        self.inner.lock().expect("clock lock").source
    }

    /// Subscribes to position updates.
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        // ---
        self.position_tx.subscribe()
    }

    /// Hands the clock to a different update source.
    ///
    /// Callers must stop the old source first; the marker only catches
    /// stragglers that outlive the hand-off.
    pub fn set_source(&self, source: ClockSource) {
        // ---
        let mut clock = self.inner.lock().expect("clock lock");
        if clock.source != source {
            debug!("Clock source: {:?} -> {:?}", clock.source, source);
            clock.source = source;
        }
    }

    /// Advances the position by one ticker period.
    pub fn tick(&self) {
        // ---
        let mut clock = self.inner.lock().expect("clock lock");
        if clock.source != ClockSource::Ticker {
            warn!("Dropping tick: decode updates own the clock");
            return;
        }

        clock.position_ms += TICK_PERIOD.as_millis() as i64;
        self.position_tx.send_replace(clock.position_ms);
    }

    /// Applies a decode-derived position.
    ///
    /// Ignored while the ticker owns the clock. The position never moves
    /// backward here; only an explicit resync may do that.
    pub fn update_from_decode(&self, position_ms: i64) -> bool {
        // ---
        let mut clock = self.inner.lock().expect("clock lock");
        if clock.source != ClockSource::Decode {
            warn!("Dropping decode-driven update: ticker owns the clock");
            return false;
        }

        clock.position_ms = clock.position_ms.max(position_ms);
        self.position_tx.send_replace(clock.position_ms);
        true
    }

    /// Sets the buffering hint without touching the position.
    pub fn set_buffer_hint(&self, buffer_hint_ms: i64) {
        // ---
        self.inner.lock().expect("clock lock").buffer_hint_ms = buffer_hint_ms;
    }

    /// Resets the clock from fresh external metadata.
    ///
    /// The only path allowed to move the position backward.
    pub fn resync(&self, at_ms: i64, buffer_hint_ms: i64) {
        // ---
        let mut clock = self.inner.lock().expect("clock lock");
        debug!(
            "Resync: position {} -> {}, buffer hint {}ms",
            clock.position_ms, at_ms, buffer_hint_ms
        );
        clock.position_ms = at_ms;
        clock.buffer_hint_ms = buffer_hint_ms;
        self.position_tx.send_replace(clock.position_ms);
    }
}

impl Default for SharedClock {
    fn default() -> Self {
        // ---
        Self::new()
    }
}

/// Synthetic ticker task.
///
/// Runs while no real audio is flowing (stopped, between tracks, during
/// reconnect backoff) so displayed progress keeps moving. Purely additive:
/// it never reads device state.
pub struct Ticker {
    // ---
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Ticker {
    // ---
    /// Starts ticking and claims the clock for the ticker source.
    pub fn start(clock: SharedClock) -> Self {
        // ---
        clock.set_source(ClockSource::Ticker);

        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            // ---
            let start = tokio::time::Instant::now() + TICK_PERIOD;
            let mut interval = tokio::time::interval_at(start, TICK_PERIOD);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => clock.tick(),
                }
            }
        });

        Self { cancel, handle }
    }

    /// Stops the ticker and waits for the task to finish.
    ///
    /// After this returns, no further tick can land, so it is safe to hand
    /// the clock to decode-driven updates.
    pub async fn stop(self) {
        // ---
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
