//! Shared utilities for the live player.
//!
//! This crate centralizes observability (Prometheus metrics + tracing
//! initialization) and CLI policy so the player binary and tests behave
//! consistently.

pub mod cli;
pub mod observability;

pub use cli::ColorWhen;
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
