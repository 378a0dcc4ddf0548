//! Tracing Infrastructure
//!
//! Structured logging for the library and the `lab_daq` binary, built on
//! `tracing` and `tracing-subscriber`:
//! - Structured fields on every event (`device = %name`, `step = n`)
//! - Pretty, compact or JSON output
//! - `RUST_LOG` overrides the configured level
//!
//! # Example
//! ```no_run
//! use lab_daq::{config::LabConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LabConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!(devices = config.devices.len(), "Application started");
//! # Ok(())
//! # }
//! ```

use crate::config::LabConfig;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for interactive use)
    Pretty,
    /// Single-line format without colors
    Compact,
    /// JSON lines for log aggregation
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                s
            )),
        }
    }
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Maximum level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Include span NEW/CLOSE events
    pub with_span_events: bool,
    /// Include source file and line
    pub with_file_and_line: bool,
    /// Include thread names
    pub with_thread_names: bool,
    /// ANSI colors (Pretty only)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Create tracing config from the application configuration
    pub fn from_config(config: &LabConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Pretty output at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span open/close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable ANSI colours.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from the application configuration
///
/// Fails only on an unknown level or format in `config`.
pub fn init_from_config(config: &LabConfig) -> Result<(), String> {
    init(TracingConfig::from_config(config)?);
    Ok(())
}

/// Initialize tracing with custom configuration
///
/// Idempotent: if a global subscriber is already installed (by an earlier call,
/// a test harness or a host application) that subscriber is kept, so tests and
/// embedding applications may call it freely.
pub fn init(config: TracingConfig) {
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
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    let layer = match config.format {
        OutputFormat::Pretty => base
            .pretty()
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).with_filter(env_filter).boxed(),
        OutputFormat::Json => base.json().with_filter(env_filter).boxed(),
    };

    let installed = tracing_subscriber::registry()
        .with(layer)
        .try_init();
    if let Err(e) = installed {
        tracing::debug!(error = %e, "Global subscriber already installed, keeping it");
    }
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
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
    fn test_tracing_config_from_lab_config() {
        let mut config = LabConfig::default();
        config.application.log_level = "debug".to_string();
        config.application.log_format = "json".to_string();

        let tracing_config = TracingConfig::from_config(&config).unwrap();
        assert_eq!(tracing_config.level, Level::DEBUG);
        assert_eq!(tracing_config.format, OutputFormat::Json);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = TracingConfig::new(Level::WARN)
            .with_format(OutputFormat::Compact)
            .with_ansi(false);
        init(config.clone());
        init(config);
        assert!(tracing::dispatcher::has_been_set());
    }
}
