//! Logging configuration
//!
//! Structured logging with tracing.

use tracing_subscriber::EnvFilter;

/// Initialize logging.
///
/// `debug` raises this crate to debug level; `debug_overlay` raises
/// everything, including overlay/local-API chatter, to trace. `RUST_LOG`
/// overrides both.
pub fn init(debug: bool, debug_overlay: bool) {
    let default = if debug_overlay {
        "trace"
    } else if debug {
        "tailbalance=debug"
    } else {
        "tailbalance=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
