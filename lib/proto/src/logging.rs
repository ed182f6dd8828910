//! Funnel module for structured logging so the rest of the workspace only
//! imports from one place.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::{Build, Config, LoggerConfig};

/// Builds the root logger from the daemon's `[log]` config table.
pub fn init(config: &LoggerConfig) -> Result<Logger, sloggers::Error> {
    config.build_logger()
}

/// Stderr terminal logger used when no config file is supplied.
pub fn default_logger() -> Result<Logger, sloggers::Error> {
    TerminalLoggerBuilder::new()
        .level(Severity::Info)
        .destination(Destination::Stderr)
        .build()
}

/// Logger that drops everything. Handy default for tests and detached
/// components.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
