//! Tracing setup for host processes.
//!
//! The library itself only emits `tracing` events; hosts that want output call
//! [`init`] once at startup (or install their own subscriber).

use tracing_subscriber::EnvFilter;

/// Initialize a stderr subscriber honoring `RUST_LOG`, falling back to the
/// given default directive. Safe to call once per process.
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
