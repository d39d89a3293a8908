//! Tracing setup for the binary (spec §3.1): a single `fmt` layer filtered
//! by `RUST_LOG`, falling back to `info` when unset. Deliberately not the
//! multi-layer (console/journald/logfile) setup `arti`'s `trace.rs` builds —
//! out of proportion for this crate's scope.

use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber. Call once, at the top of `main`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
