//! Tracing setup for the `harq` binary.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Filter used by [`init`]: `RUST_LOG` when it is set and valid, otherwise
/// the configured `log.level`.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::default().add_directive(parse_level(level).into()))
}

/// Unknown names fall back to `info`.
fn parse_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "off" => LevelFilter::OFF,
        "error" => LevelFilter::ERROR,
        "warn" | "warning" => LevelFilter::WARN,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    }
}

pub fn init(level: &str) {
    // try_init: tests and the replica bootstrap may call this more than once
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_target(false)
        .try_init();
}
