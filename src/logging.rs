//! Subscriber setup for the command-line binary
//!
//! Library code only emits `tracing` events. The binary calls [`init`] once;
//! logs always go to stderr because stdout carries the balance CSV.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber
///
/// `RUST_LOG`, when set and valid, overrides `level`.
///
/// # Errors
///
/// Returns a message if a global subscriber is already installed.
pub fn init(level: &str, json: bool) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    result.map_err(|e| format!("Failed to initialize logging: {}", e))
}
