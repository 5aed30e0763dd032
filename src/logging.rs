//! Structured logging setup.
//!
//! HTTP mode logs JSON to stdout for log shippers; stdio and fetch modes log
//! human-readable text to stderr because stdout carries the MCP wire
//! protocol. The level comes from `LOG_LEVEL` (default `info`).

use tracing::level_filters::LevelFilter;

/// Parses a `LOG_LEVEL` value, defaulting to `info` on anything unknown.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.trim().to_ascii_lowercase().as_str() {
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

fn level_from_env() -> LevelFilter {
    parse_level(&std::env::var("LOG_LEVEL").unwrap_or_default())
}

/// Installs the global subscriber.
///
/// `to_stderr` selects the stdio/fetch flavor: compact text on stderr.
pub fn init(to_stderr: bool) {
    let level = level_from_env();

    if to_stderr {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(level)
            .with_current_span(false)
            .init();
    }
}
