//! Tracing subscriber setup.
//!
//! - `RUST_LOG`: filter directives, default `info`
//! - `LOG_FORMAT`: `json` for JSON lines, anything else for human-readable output

use std::env;

use tracing_subscriber::EnvFilter;

/// Initialize tracing for the process. Subsequent calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if json {
        builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init()
    } else {
        builder.with_target(false).try_init()
    };
}
