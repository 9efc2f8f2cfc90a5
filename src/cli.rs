//! Pieces shared by the `cgsup-*` binaries.
use clap::ValueEnum;
use log::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warning => LevelFilter::Warn,
            // `log` has no level above error
            LogLevel::Error | LogLevel::Critical => LevelFilter::Error,
        }
    }
}

/// Installs the process-wide logger. `RUST_LOG` refines `level` per module.
pub fn init_logging(level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(level.into())
        .parse_default_env()
        .format_target(false)
        .init();
}
