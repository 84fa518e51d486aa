//! Structured logging setup.
//!
//! Everything in this crate logs through `tracing` with structured fields
//! (`port`, `module`, `elapsed_ms`). This module installs a
//! `tracing-subscriber` registry with an `EnvFilter` and one `fmt` layer in the
//! requested format. `RUST_LOG` overrides the configured level when set.
//!
//! # Example
//! ```no_run
//! use deck_modules::{config::ModulesConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ModulesConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(port = "/dev/modules/ttyACM0_tempdeck", "module attached");
//! # Ok(())
//! # }
//! ```

use crate::config::ModulesConfig;
use crate::error::{ModuleError, ModuleResult};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored output for a terminal
    Pretty,
    /// Single-line output without colors
    Compact,
    /// One JSON object per event
    Json,
}

/// Logging configuration options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Emit span open/close events
    pub with_span_events: bool,
    /// Include source file and line
    pub with_file_and_line: bool,
    /// Enable ANSI colors (Pretty only)
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Logging config at the given level with default options
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Derive logging options from the application configuration
    pub fn from_modules_config(config: &ModulesConfig) -> ModuleResult<Self> {
        Ok(Self::new(parse_log_level(&config.application.log_level)?))
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize logging from the application configuration
pub fn init_from_config(config: &ModulesConfig) -> ModuleResult<()> {
    init(LoggingConfig::from_modules_config(config)?)
}

/// Install the global subscriber.
///
/// Calling this again after a subscriber is installed is a no-op, so tests and
/// embedding applications can call it freely.
pub fn init(config: LoggingConfig) -> ModuleResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line);

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().with_ansi(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
        .map_err(|e| ModuleError::Configuration(format!("Failed to initialize logging: {e}")))
}

/// Parse a log level string into a tracing `Level`
fn parse_log_level(level: &str) -> ModuleResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(ModuleError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_logging_config_from_modules_config() {
        let mut modules_config = ModulesConfig::default();
        modules_config.application.log_level = "debug".to_string();

        let config = LoggingConfig::from_modules_config(&modules_config).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, OutputFormat::Compact);
    }

    #[test]
    fn test_logging_config_builder() {
        let config = LoggingConfig::new(Level::WARN)
            .with_format(OutputFormat::Json)
            .with_span_events(true)
            .with_ansi(false);

        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.with_span_events);
        assert!(!config.with_ansi);
    }
}
