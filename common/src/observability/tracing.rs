//! Tracing initialization.
//!
//! Centralizes tracing config so the player binary and test tooling behave
//! the same.

use crate::ColorWhen;
use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// - Respects `RUST_LOG` via `EnvFilter`, defaulting to `info`.
/// - Writes to stderr, leaving stdout free for piped output.
/// - ANSI color controlled by `ColorWhen`.
///
/// # Errors
///
/// Returns error if a global subscriber is already installed.
pub fn init_tracing(color: ColorWhen) -> Result<()> {
    // ---
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(color.should_color_stderr())
        .try_init()
        .map_err(|e| anyhow!("failed to set global tracing subscriber: {e}"))
}
