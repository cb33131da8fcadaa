//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::EnvFilter;

/// Initialize tracing with the default configuration: `RUST_LOG` if
/// set, otherwise `warn`.
pub fn initialize_tracing() {
    initialize_tracing_with_verbosity(0)
}

/// Initialize tracing, letting repeated `-v` occurrences raise the
/// default level when `RUST_LOG` is not set: 0 -> warn, 1 -> info,
/// 2+ -> debug. `RUST_LOG`, when present, always takes precedence
/// over the verbosity count.
pub fn initialize_tracing_with_verbosity(verbosity: u8) {
    // Don't include timestamps and such because they're not really useful and
    // too verbose, and plus several log targets such as journald will already
    // include timestamps.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // Log to stderr by default
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}
