//! Bounded reconnection with backoff.
//!
//! One state machine serves both unreliable connections in the system: the
//! media stream fetch and the control channel. It is driven by discrete
//! events (connecting, opened, failed, restart) rather than socket
//! callbacks, so it unit-tests without any network.

use std::time::Duration;
use tracing::{debug, info};

/// Fixed retry delays for the media stream connection.
const MEDIA_STREAM_DELAYS: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
];

/// Delay growth strategy.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Explicit per-attempt delays.
    Table(&'static [Duration]),

    /// `base * factor^attempt`, capped at `max`.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
    },
}

impl Backoff {
    // ---
    /// Delay before retrying after the given failure count.
    pub fn delay(&self, attempt: u32) -> Duration {
        // ---
        match self {
            Backoff::Table(delays) => {
                let idx = (attempt as usize).min(delays.len().saturating_sub(1));
                delays[idx]
            }
            Backoff::Exponential { base, factor, max } => {
                let scaled = base.as_secs_f64() * factor.powi(attempt as i32);
                Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
            }
        }
    }
}

/// Retry budget and delay schedule for one logical connection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    // ---
    pub backoff: Backoff,

    /// Automatic attempts allowed before giving up.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    // ---
    /// Policy for the media stream fetch: 1s, 2s, 4s, 8s, 16s, then give up.
    pub fn media_stream() -> Self {
        // ---
        Self {
            backoff: Backoff::Table(&MEDIA_STREAM_DELAYS),
            max_attempts: MEDIA_STREAM_DELAYS.len() as u32,
        }
    }

    /// Policy for the control channel: 1s growing by 1.5x, capped at 30s,
    /// ten attempts.
    pub fn control_channel() -> Self {
        // ---
        Self {
            backoff: Backoff::Exponential {
                base: Duration::from_secs(1),
                factor: 1.5,
                max: Duration::from_secs(30),
            },
            max_attempts: 10,
        }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    // ---
    Disconnected,
    Connecting,
    Connected,

    /// Retry budget exhausted; only an explicit restart leaves this state.
    GaveUp,
}

/// Per-connection attempt tracking.
///
/// Owned by whichever logical connection instantiates it. The owner reports
/// events; this struct answers "wait how long?" or "give up".
#[derive(Debug)]
pub struct ConnectionAttempt {
    // ---
    policy: ReconnectPolicy,
    attempt: u32,
    state: ConnectionState,
}

impl ConnectionAttempt {
    // ---
    pub fn new(policy: ReconnectPolicy) -> Self {
        // ---
        Self {
            policy,
            attempt: 0,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        // ---
        self.state
    }

    /// Consecutive failures since the last successful open.
    pub fn attempt_count(&self) -> u32 {
        // ---
        self.attempt
    }

    /// Records the start of a connection attempt.
    pub fn connecting(&mut self) {
        // ---
        self.state = ConnectionState::Connecting;
    }

    /// Records a successful open: the budget and delay schedule reset.
    pub fn opened(&mut self) {
        // ---
        if self.attempt > 0 {
            info!("Reconnected after {} failed attempt(s)", self.attempt);
        }
        self.attempt = 0;
        self.state = ConnectionState::Connected;
    }

    /// Records a failure.
    ///
    /// Returns the delay to wait before the next automatic attempt, or
    /// `None` when the budget is exhausted and the connection is terminally
    /// failed until an explicit restart.
    pub fn failed(&mut self) -> Option<Duration> {
        // ---
        if self.attempt >= self.policy.max_attempts {
            info!(
                "Giving up after {} reconnect attempt(s)",
                self.policy.max_attempts
            );
            self.state = ConnectionState::GaveUp;
            return None;
        }

        let delay = self.policy.backoff.delay(self.attempt);
        self.attempt += 1;
        self.state = ConnectionState::Disconnected;

        debug!(
            "Reconnecting in {:.1}s (attempt {}/{})",
            delay.as_secs_f64(),
            self.attempt,
            self.policy.max_attempts
        );

        Some(delay)
    }

    /// Explicit user-initiated restart: clears the terminal state and the
    /// failure budget.
    pub fn restart(&mut self) {
        // ---
        self.attempt = 0;
        self.state = ConnectionState::Disconnected;
    }
}
