//! Logger setup for binaries and demos embedding the store.
//!
//! The library itself only uses the `log` facade; nothing is printed unless
//! the host installs a logger, either its own or this one.

use simplelog::{ConfigBuilder, SimpleLogger, WriteLogger};
use std::fmt;
use std::fs::File;

use crate::core::config::ResolvedConfig;

#[derive(Debug)]
pub enum LoggingError {
    Io(std::io::Error),
    /// A global logger was already installed.
    AlreadySet(log::SetLoggerError),
}

impl fmt::Display for LoggingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoggingError::Io(e) => write!(f, "could not open log file: {e}"),
            LoggingError::AlreadySet(e) => write!(f, "logger already initialized: {e}"),
        }
    }
}

impl std::error::Error for LoggingError {}

/// Installs a global logger at `config.log_level`.
///
/// Writes to `config.log_file` when set, otherwise to the terminal.
pub fn init(config: &ResolvedConfig) -> Result<(), LoggingError> {
    let log_config = ConfigBuilder::new().set_time_format_rfc3339().build();

    match &config.log_file {
        Some(path) => {
            let file = File::create(path).map_err(LoggingError::Io)?;
            WriteLogger::init(config.log_level, log_config, file).map_err(LoggingError::AlreadySet)?;
        }
        None => {
            SimpleLogger::init(config.log_level, log_config).map_err(LoggingError::AlreadySet)?;
        }
    }

    log::info!(
        "Logging initialized for `{}` at {}",
        config.name,
        config.log_level
    );
    Ok(())
}
