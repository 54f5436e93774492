//! Gapless PCM scheduling on the output device timeline.
//!
//! Decoded blocks arrive with network and decode jitter; the cursor places
//! them back-to-back on the device clock so playback has no overlap and no
//! unbounded gap. If decode falls behind real time the cursor snaps forward
//! and the audible skip is counted, but no block is ever dropped.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::codec::DecodedAudio;
use crate::output::OutputDevice;

/// Initial scheduling lookahead applied when a session goes live, so the
/// first blocks are not starved while the pipeline warms up.
pub const DEFAULT_LOOKAHEAD: Duration = Duration::from_millis(100);

/// Forward-only pointer marking the end of already-scheduled audio.
///
/// Pure bookkeeping over `f64` device seconds; all device interaction lives
/// in [`AudioScheduler`]. Replaying the same block durations against the
/// same `device_now` values always lands on the same final cursor.
#[derive(Debug, Clone)]
pub struct ScheduleCursor {
    // ---
    scheduled_until: f64,
    lookahead: f64,
    primed: bool,
}

impl ScheduleCursor {
    // ---
    pub fn new(lookahead: Duration) -> Self {
        // ---
        Self {
            scheduled_until: 0.0,
            lookahead: lookahead.as_secs_f64(),
            primed: false,
        }
    }

    /// Whether the initial lookahead has been applied.
    pub fn is_primed(&self) -> bool {
        // ---
        self.primed
    }

    /// Applies the initial lookahead. Called once per session, right before
    /// the first block is placed.
    pub fn prime(&mut self, device_now: f64) {
        // ---
        self.scheduled_until = device_now + self.lookahead;
        self.primed = true;
    }

    /// Computes the start time for the next block and advances the cursor.
    ///
    /// Returns `(start, underrun)`. The block starts at
    /// `max(scheduled_until, device_now)`; scheduling into the past is never
    /// allowed, so a late cursor snaps forward instead.
    pub fn place(&mut self, device_now: f64, block_secs: f64) -> (f64, bool) {
        // ---
        let underrun = self.scheduled_until < device_now;
        let start = if underrun {
            device_now
        } else {
            self.scheduled_until
        };

        self.scheduled_until = start + block_secs;
        (start, underrun)
    }

    /// Scheduling lead over the device clock, in milliseconds.
    ///
    /// Negative when the cursor has fallen behind.
    pub fn lead_ms(&self, device_now: f64) -> i64 {
        // ---
        ((self.scheduled_until - device_now) * 1000.0).round() as i64
    }

    pub fn scheduled_until(&self) -> f64 {
        // ---
        self.scheduled_until
    }
}

/// Result of scheduling one block.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleOutcome {
    // ---
    /// Device time at which the block starts.
    pub start: f64,

    /// Whether the cursor had fallen behind the device clock.
    pub underrun: bool,
}

/// Places decoded blocks onto an [`OutputDevice`].
///
/// Channel data is copied verbatim (no resampling, no mixing); the device
/// stream is opened lazily from the first block's format.
pub struct AudioScheduler {
    // ---
    device: Arc<dyn OutputDevice>,
    cursor: ScheduleCursor,
}

impl AudioScheduler {
    // ---
    pub fn new(device: Arc<dyn OutputDevice>, lookahead: Duration) -> Self {
        // ---
        Self {
            device,
            cursor: ScheduleCursor::new(lookahead),
        }
    }

    /// Current device clock reading, in seconds.
    pub fn device_now(&self) -> f64 {
        // ---
        self.device.now()
    }

    /// Scheduling lead used for latency compensation, in milliseconds.
    ///
    /// Zero before the first block: nothing is scheduled yet, so the
    /// displayed position has no scheduling delay to subtract.
    pub fn lead_ms(&self) -> i64 {
        // ---
        if !self.cursor.is_primed() {
            return 0;
        }
        self.cursor.lead_ms(self.device.now())
    }

    /// Schedules one decoded block back-to-back after previously scheduled
    /// audio.
    pub fn schedule(&mut self, audio: &DecodedAudio) -> Result<ScheduleOutcome> {
        // ---
        let rate = audio
            .sample_rate
            .context("cannot schedule audio without a sample rate")?;
        let channels = audio.channel_data.len();

        self.device.ensure_open(rate, channels)?;

        if !self.cursor.is_primed() {
            self.cursor.prime(self.device.now());
        }

        let device_now = self.device.now();
        let block_secs = audio.duration_secs();
        let lag_secs = device_now - self.cursor.scheduled_until();
        let (start, underrun) = self.cursor.place(device_now, block_secs);

        if underrun {
            warn!(
                "Scheduling fell behind device clock by {:.0}ms, snapping forward",
                lag_secs * 1000.0
            );
        }

        // Realize the start time on the pull-based device: pad the queue
        // with silence up to the start point, then append the block.
        let queue_end = device_now + self.device.buffered_secs();
        if start > queue_end {
            let gap_frames = ((start - queue_end) * rate as f64).round() as usize;
            if gap_frames > 0 {
                self.device.write(&vec![0.0; gap_frames * channels])?;
            }
        }

        let interleaved = interleave(&audio.channel_data, audio.samples_decoded);
        self.device.write(&interleaved)?;

        debug!(
            "Scheduled {:.1}ms block at t={:.3}s (lead {:.0}ms)",
            block_secs * 1000.0,
            start,
            self.cursor.lead_ms(device_now)
        );

        Ok(ScheduleOutcome { start, underrun })
    }
}

/// Interleaves planar channel data, copying samples verbatim.
fn interleave(channel_data: &[Vec<f32>], samples: usize) -> Vec<f32> {
    // ---
    let channels = channel_data.len();
    let mut out = vec![0.0f32; samples * channels];

    for (ch, data) in channel_data.iter().enumerate() {
        for (i, &sample) in data.iter().take(samples).enumerate() {
            out[i * channels + ch] = sample;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::Mutex;

    /// Test device with a manually driven clock.
    struct TestDevice {
        // ---
        now: Mutex<f64>,
        written: Mutex<Vec<f32>>,
        open_format: Mutex<Option<(u32, usize)>>,
    }

    impl TestDevice {
        fn new() -> Arc<Self> {
            // ---
            Arc::new(Self {
                now: Mutex::new(0.0),
                written: Mutex::new(Vec::new()),
                open_format: Mutex::new(None),
            })
        }

        fn set_now(&self, t: f64) {
            // ---
            *self.now.lock().unwrap() = t;
        }

        fn written_len(&self) -> usize {
            // ---
            self.written.lock().unwrap().len()
        }
    }

    impl OutputDevice for TestDevice {
        fn now(&self) -> f64 {
            *self.now.lock().unwrap()
        }

        fn buffered_secs(&self) -> f64 {
            // Nothing is consumed in tests: everything written is queued.
            let format = self.open_format.lock().unwrap();
            match *format {
                Some((rate, channels)) => {
                    self.written_len() as f64 / channels as f64 / rate as f64
                }
                None => 0.0,
            }
        }

        fn ensure_open(&self, sample_rate: u32, channels: usize) -> Result<()> {
            *self.open_format.lock().unwrap() = Some((sample_rate, channels));
            Ok(())
        }

        fn write(&self, interleaved: &[f32]) -> Result<()> {
            self.written.lock().unwrap().extend_from_slice(interleaved);
            Ok(())
        }
    }

    fn block(samples: usize, channels: usize) -> DecodedAudio {
        // ---
        DecodedAudio {
            sample_rate: Some(48_000),
            channel_data: vec![vec![0.5; samples]; channels],
            samples_decoded: samples,
        }
    }

    #[test]
    fn test_cursor_places_back_to_back() {
        // ---
        let mut cursor = ScheduleCursor::new(Duration::from_millis(100));
        cursor.prime(0.0);

        let (start1, underrun1) = cursor.place(0.0, 1.0);
        let (start2, underrun2) = cursor.place(0.5, 1.0);

        assert!((start1 - 0.1).abs() < 1e-9);
        assert!((start2 - 1.1).abs() < 1e-9);
        assert!(!underrun1);
        assert!(!underrun2);
        assert!((cursor.scheduled_until() - 2.1).abs() < 1e-9);
    }

    #[test]
    fn test_cursor_snaps_forward_on_underrun() {
        // ---
        let mut cursor = ScheduleCursor::new(Duration::ZERO);
        cursor.prime(0.0);

        cursor.place(0.0, 0.02);

        // Device clock has raced past the cursor
        let (start, underrun) = cursor.place(5.0, 0.02);
        assert!(underrun);
        assert!((start - 5.0).abs() < 1e-9);
        assert!((cursor.scheduled_until() - 5.02).abs() < 1e-9);
    }

    #[test]
    fn test_cursor_replay_is_deterministic() {
        // ---
        let script: &[(f64, f64)] = &[(0.0, 0.02), (0.013, 0.02), (0.051, 0.02), (0.09, 0.02)];

        let run = || {
            let mut cursor = ScheduleCursor::new(Duration::from_millis(100));
            cursor.prime(0.0);
            for &(device_now, block_secs) in script {
                cursor.place(device_now, block_secs);
            }
            cursor.scheduled_until()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn test_lead_reflects_buffer_depth() {
        // ---
        let mut cursor = ScheduleCursor::new(Duration::ZERO);
        cursor.prime(0.0);
        cursor.place(0.0, 1.5);

        assert_eq!(cursor.lead_ms(0.0), 1500);
        assert_eq!(cursor.lead_ms(1.0), 500);
        assert_eq!(cursor.lead_ms(2.0), -500);
    }

    #[test]
    fn test_scheduler_writes_lookahead_silence_first() {
        // ---
        let device = TestDevice::new();
        let mut scheduler = AudioScheduler::new(device.clone(), Duration::from_millis(100));

        let outcome = scheduler.schedule(&block(960, 2)).unwrap();

        assert!((outcome.start - 0.1).abs() < 1e-9);

        // 100ms of stereo silence at 48kHz plus the 960-sample block
        let expected = 4800 * 2 + 960 * 2;
        assert_eq!(device.written_len(), expected);
    }

    #[test]
    fn test_scheduler_appends_without_extra_silence() {
        // ---
        let device = TestDevice::new();
        let mut scheduler = AudioScheduler::new(device.clone(), Duration::from_millis(100));

        scheduler.schedule(&block(960, 2)).unwrap();
        let before = device.written_len();

        scheduler.schedule(&block(960, 2)).unwrap();
        assert_eq!(device.written_len(), before + 960 * 2);
    }

    #[test]
    fn test_scheduler_counts_underrun_but_keeps_block() {
        // ---
        let device = TestDevice::new();
        let mut scheduler = AudioScheduler::new(device.clone(), Duration::ZERO);

        scheduler.schedule(&block(960, 2)).unwrap();

        // Simulate real time racing far ahead of the scheduled audio.
        device.set_now(10.0);
        let outcome = scheduler.schedule(&block(960, 2)).unwrap();

        assert!(outcome.underrun);
        assert!((outcome.start - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_interleave_copies_verbatim() {
        // ---
        let planar = vec![vec![1.0f32, 2.0, 3.0], vec![-1.0, -2.0, -3.0]];
        let interleaved = interleave(&planar, 3);
        assert_eq!(interleaved, vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);
    }

    #[test]
    fn test_lead_is_zero_before_first_block() {
        // ---
        let device = TestDevice::new();
        let scheduler = AudioScheduler::new(device, Duration::from_millis(100));
        assert_eq!(scheduler.lead_ms(), 0);
    }
}
