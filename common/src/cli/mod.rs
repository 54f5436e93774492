//! CLI-related shared utilities.
//!
//! Centralizes CLI policy so the player binary and tooling behave the same.

mod color;

pub use color::ColorWhen;
