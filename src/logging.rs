//! Logging bootstrap.
//!
//! Thin wrapper around `tracing-subscriber` so binaries and tests share one
//! way of turning on structured logs, mirroring the teacher crate's pattern
//! of a single `init_tracing`-style helper rather than each call site wiring
//! up its own subscriber.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a global `tracing` subscriber reading `RUST_LOG` (default `info`).
///
/// Safe to call more than once; only the first call takes effect.
pub fn init() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .ok();
    });
}
