//! Logging bootstrap.
//!
//! The crate logs through the `log` facade; binaries and tests pick the sink.
//! These helpers install `env_logger` once and are safe to call repeatedly.

use crate::config::SecurityConfig;
use log::LevelFilter;
use std::str::FromStr;

/// Initialize `env_logger` with the given default level.
///
/// `RUST_LOG` still overrides the default. Returns `false` when a logger was
/// already installed.
pub fn init_logging(default_level: &str) -> bool {
    let level = LevelFilter::from_str(default_level).unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init()
        .is_ok()
}

/// Initialize logging from the node configuration
pub fn init_from_config(config: &SecurityConfig) -> bool {
    init_logging(&config.log_level)
}

/// Logger for tests: captured by the test harness, never fails.
pub fn init_test_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(LevelFilter::Debug)
        .try_init();
}
