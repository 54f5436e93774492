//! Consumer-facing playback surface.
//!
//! One `Player` owns the audio output device for its whole lifetime, a
//! shared playback clock, and at most one supervised streaming session. The
//! supervisor reconnects on transport failure with the media-stream backoff
//! schedule; user stop cancels everything cooperatively and hands the clock
//! back to the synthetic ticker.

use anyhow::Result;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use live_player_common::MetricsContext;

use crate::clock::{ClockSource, SharedClock, Ticker};
use crate::codec::{ChunkDecoder, OggOpusDecoder};
use crate::output::{CpalOutput, OutputDevice};
use crate::reconnect::{ConnectionAttempt, ReconnectPolicy};
use crate::scheduler::{AudioScheduler, DEFAULT_LOOKAHEAD};
use crate::session::{SessionEnd, StreamSession};
use crate::transport::{ChunkSource, HttpChunkSource};

/// High-level playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    // ---
    /// No session has ever started.
    Idle,

    /// Actively decoding and scheduling real audio.
    Live,

    /// A live session failed and a reconnect is pending.
    Retrying,

    /// Stopped by the user or by natural stream end.
    Stopped,
}

/// Player configuration.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    // ---
    /// Media stream URL.
    pub stream_url: String,

    /// Initial buffering hint; superseded by metadata resyncs.
    pub buffer_hint_ms: i64,

    /// Initial scheduling lookahead for each session.
    pub lookahead: Duration,
}

impl PlayerConfig {
    // ---
    pub fn new(stream_url: impl Into<String>) -> Self {
        // ---
        Self {
            stream_url: stream_url.into(),
            buffer_hint_ms: 0,
            lookahead: DEFAULT_LOOKAHEAD,
        }
    }
}

/// Per-attempt resource factories: a fresh transport connection and a fresh
/// decoder for every attempt. The output device is deliberately NOT here;
/// it is acquired once per player and reused across attempts.
pub struct StreamParts {
    // ---
    pub connect:
        Box<dyn Fn() -> BoxFuture<'static, Result<Box<dyn ChunkSource + Send>>> + Send + Sync>,
    pub decoder: Box<dyn Fn() -> Box<dyn ChunkDecoder> + Send + Sync>,
}

type TickerSlot = Arc<Mutex<Option<Ticker>>>;

async fn start_ticker(slot: &TickerSlot, clock: &SharedClock) {
    // ---
    let mut guard = slot.lock().await;
    if guard.is_none() {
        *guard = Some(Ticker::start(clock.clone()));
    }
}

async fn stop_ticker(slot: &TickerSlot) {
    // ---
    let ticker = slot.lock().await.take();
    if let Some(ticker) = ticker {
        ticker.stop().await;
    }
}

struct ActiveSession {
    // ---
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Playback handle.
pub struct Player {
    // ---
    config: PlayerConfig,
    device: Arc<dyn OutputDevice>,
    parts: Arc<StreamParts>,
    clock: SharedClock,
    ticker: TickerSlot,
    state_tx: Arc<watch::Sender<PlaybackState>>,
    gave_up: Arc<AtomicBool>,
    metrics: Option<MetricsContext>,
    session: Option<ActiveSession>,
}

impl Player {
    // ---
    /// Creates a player over the real HTTP transport, the bundled Ogg/Opus
    /// decoder, and the default cpal output device.
    pub fn new(config: PlayerConfig) -> Self {
        // ---
        let http = reqwest::Client::new();
        let url = config.stream_url.clone();

        let parts = StreamParts {
            connect: Box::new(move || {
                let http = http.clone();
                let url = url.clone();
                Box::pin(async move {
                    let source = HttpChunkSource::connect(&http, &url).await?;
                    Ok(Box::new(source) as Box<dyn ChunkSource + Send>)
                })
            }),
            decoder: Box::new(|| Box::new(OggOpusDecoder::new()) as Box<dyn ChunkDecoder>),
        };

        Self::with_parts(config, Arc::new(CpalOutput::new()), parts)
    }

    /// Creates a player from explicit parts.
    ///
    /// The device passed here lives as long as the player and is shared by
    /// every session attempt; tests use this to substitute scripted
    /// transports, decoders, and devices.
    pub fn with_parts(
        config: PlayerConfig,
        device: Arc<dyn OutputDevice>,
        parts: StreamParts,
    ) -> Self {
        // ---
        let clock = SharedClock::new();
        clock.set_buffer_hint(config.buffer_hint_ms);

        let (state_tx, _) = watch::channel(PlaybackState::Idle);

        Self {
            config,
            device,
            parts: Arc::new(parts),
            clock,
            ticker: Arc::new(Mutex::new(None)),
            state_tx: Arc::new(state_tx),
            gave_up: Arc::new(AtomicBool::new(false)),
            metrics: None,
            session: None,
        }
    }

    /// Attaches a metrics context.
    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        // ---
        self.metrics = Some(metrics);
        self
    }

    /// Current playback state.
    pub fn state(&self) -> PlaybackState {
        // ---
        *self.state_tx.borrow()
    }

    /// Subscribes to state changes.
    pub fn state_watch(&self) -> watch::Receiver<PlaybackState> {
        // ---
        self.state_tx.subscribe()
    }

    pub fn is_live(&self) -> bool {
        // ---
        self.state() == PlaybackState::Live
    }

    /// Current position in milliseconds.
    pub fn position_ms(&self) -> i64 {
        // ---
        self.clock.position_ms()
    }

    /// Subscribes to position updates for progress display.
    pub fn position_watch(&self) -> watch::Receiver<i64> {
        // ---
        self.clock.subscribe()
    }

    /// Whether the last session exhausted its retry budget.
    ///
    /// Cleared by the next `start()`.
    pub fn gave_up(&self) -> bool {
        // ---
        self.gave_up.load(Ordering::SeqCst)
    }

    /// Starts a supervised playback session.
    ///
    /// Any existing session is stopped first. This is also the explicit
    /// restart that clears a previous "gave up" outcome.
    pub async fn start(&mut self) {
        // ---
        if self.session.is_some() {
            self.stop().await;
        }

        self.gave_up.store(false, Ordering::SeqCst);

        let stop = CancellationToken::new();
        let ctx = SuperviseCtx {
            parts: Arc::clone(&self.parts),
            device: Arc::clone(&self.device),
            clock: self.clock.clone(),
            ticker: Arc::clone(&self.ticker),
            state_tx: Arc::clone(&self.state_tx),
            stop: stop.clone(),
            lookahead: self.config.lookahead,
            gave_up: Arc::clone(&self.gave_up),
            metrics: self.metrics.clone(),
        };

        let task = tokio::spawn(supervise(ctx));
        self.session = Some(ActiveSession { stop, task });
    }

    /// Stops playback.
    ///
    /// Cancels the session cooperatively, waits for it to wind down, and
    /// leaves the synthetic ticker advancing displayed progress.
    pub async fn stop(&mut self) {
        // ---
        match self.session.take() {
            Some(active) => {
                active.stop.cancel();
                let _ = active.task.await;
            }
            None => {
                // Nothing to cancel; just keep the display moving.
                start_ticker(&self.ticker, &self.clock).await;
                self.state_tx.send_replace(PlaybackState::Stopped);
            }
        }
    }

    /// Toggles between playing and stopped.
    pub async fn toggle(&mut self) {
        // ---
        if self.session.is_some() {
            self.stop().await;
        } else {
            self.start().await;
        }
    }

    /// Resyncs the clock from fresh external metadata.
    ///
    /// The only path that may move the position backward. Outside of live
    /// playback this (re)starts the ticker so progress keeps advancing.
    pub async fn resync(&mut self, at_ms: i64, buffer_hint_ms: i64) {
        // ---
        self.clock.resync(at_ms, buffer_hint_ms);

        if !self.is_live() {
            start_ticker(&self.ticker, &self.clock).await;
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        // ---
        if let Some(active) = &self.session {
            active.stop.cancel();
        }
    }
}

struct SuperviseCtx {
    // ---
    parts: Arc<StreamParts>,
    device: Arc<dyn OutputDevice>,
    clock: SharedClock,
    ticker: TickerSlot,
    state_tx: Arc<watch::Sender<PlaybackState>>,
    stop: CancellationToken,
    lookahead: Duration,
    gave_up: Arc<AtomicBool>,
    metrics: Option<MetricsContext>,
}

/// Supervision loop for the media stream: run attempts, back off between
/// failures, give up when the budget is spent.
async fn supervise(ctx: SuperviseCtx) {
    // ---
    let mut attempt = ConnectionAttempt::new(ReconnectPolicy::media_stream());

    loop {
        // Decode updates own the clock from here; the ticker must be fully
        // stopped before the first one is applied.
        stop_ticker(&ctx.ticker).await;
        ctx.clock.set_source(ClockSource::Decode);
        ctx.state_tx.send_replace(PlaybackState::Live);

        attempt.connecting();
        match run_attempt(&ctx).await {
            Ok(SessionEnd::EndOfStream) => {
                info!("Playback finished: stream ended");
                break;
            }
            Ok(SessionEnd::Cancelled) => {
                info!("Playback stopped");
                break;
            }
            Err(e) => {
                warn!("Stream attempt failed: {:#}", e);

                // A user stop that raced the failure is still a stop.
                if ctx.stop.is_cancelled() {
                    break;
                }

                ctx.state_tx.send_replace(PlaybackState::Retrying);
                start_ticker(&ctx.ticker, &ctx.clock).await;

                match attempt.failed() {
                    Some(delay) => {
                        if let Some(metrics) = &ctx.metrics {
                            metrics.stream_reconnects_total.inc();
                        }

                        tokio::select! {
                            _ = ctx.stop.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }

                        // A stop can race the backoff timer.
                        if ctx.stop.is_cancelled() {
                            break;
                        }
                    }
                    None => {
                        ctx.gave_up.store(true, Ordering::SeqCst);
                        if let Some(metrics) = &ctx.metrics {
                            metrics.gave_up_total.inc();
                        }
                        break;
                    }
                }
            }
        }
    }

    // Whatever ended the session, displayed progress keeps moving.
    start_ticker(&ctx.ticker, &ctx.clock).await;
    ctx.state_tx.send_replace(PlaybackState::Stopped);
}

/// One connection + session attempt.
///
/// The decoder is created fresh per attempt and owned by the session; the
/// device is the player's long-lived one.
async fn run_attempt(ctx: &SuperviseCtx) -> Result<SessionEnd> {
    // ---
    let mut source = (ctx.parts.connect)().await?;
    let decoder = (ctx.parts.decoder)();
    let scheduler = AudioScheduler::new(Arc::clone(&ctx.device), ctx.lookahead);

    let mut session = StreamSession::new(decoder, scheduler, ctx.clock.clone(), ctx.stop.clone());
    if let Some(metrics) = &ctx.metrics {
        session = session.with_metrics(metrics.clone());
    }

    session.run(source.as_mut()).await
}
