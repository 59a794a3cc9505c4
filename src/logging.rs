//! Tracing setup for the runtime.
//!
//! Everything in the crate logs through `tracing` macros; this module installs
//! the subscriber that prints them. `RUST_LOG`, when set, replaces the
//! configured level filter.
//!
//! # Example
//! ```no_run
//! use av_control::logging::{self, LogFormat, LoggingConfig};
//! use tracing::Level;
//!
//! logging::init(&LoggingConfig::new(Level::DEBUG).with_format(LogFormat::Json)).unwrap();
//! tracing::info!(device = "Projector", "link up");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt as layer_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured (development)
    #[default]
    Pretty,
    /// One line per event (production)
    Compact,
    /// Newline-delimited JSON (log shipping)
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!(
                "Invalid log format '{other}'. Must be one of: pretty, compact, json"
            )),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        })
    }
}

/// Subscriber options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Show the module path of each event
    pub with_targets: bool,
    pub with_thread_ids: bool,
    /// ANSI colours, Pretty format only
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_targets: true,
            with_thread_ids: false,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Build from the `[application]` log settings.
    pub fn from_names(level: &str, format: LogFormat) -> Result<Self, String> {
        Ok(Self::new(parse_log_level(level)?).with_format(format))
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    #[must_use]
    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.with_thread_ids = enabled;
        self
    }
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed this returns `Ok(())`,
/// so tests and embedding applications can call it freely.
pub fn init(config: &LoggingConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let layer = match config.format {
        LogFormat::Pretty => layer_fmt::layer()
            .pretty()
            .with_target(config.with_targets)
            .with_thread_ids(config.with_thread_ids)
            .with_ansi(config.with_ansi)
            .boxed(),
        LogFormat::Compact => layer_fmt::layer()
            .compact()
            .with_target(config.with_targets)
            .with_thread_ids(config.with_thread_ids)
            .with_ansi(false)
            .boxed(),
        LogFormat::Json => layer_fmt::layer()
            .json()
            .with_target(config.with_targets)
            .with_thread_ids(config.with_thread_ids)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .or_else(|e| {
            if e.to_string().contains("a global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {e}"))
            }
        })
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}
