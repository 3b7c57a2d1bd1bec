//! Diagnostic logging init (`tracing`/`tracing-subscriber`), separate from
//! the data logs in `state/*.jsonl` which are durable records, not traces.

use tracing_subscriber::EnvFilter;

/// Reads `RUST_LOG`, defaulting to `info` for this crate and `warn`
/// elsewhere, matching the filter style common across the pack.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,taskloop=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
