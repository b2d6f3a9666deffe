//! Tracing setup for the readout controller.
//!
//! Structured, async-aware logging on top of `tracing` and `tracing-subscriber` in pretty,
//! compact or JSON form. `RUST_LOG` takes precedence over the configured level.
//! Initialization is idempotent, so tests and every CLI subcommand may call it.
//!
//! # Example
//! ```no_run
//! use mkid_readout::{config::ReadoutConfig, tracing_init};
//! use mkid_readout::tracing_init::{OutputFormat, TracingConfig};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ReadoutConfig::load()?;
//! let level = tracing_init::parse_log_level(&config.application.log_level)?;
//! tracing_init::init(TracingConfig::new(level).with_format(OutputFormat::Json))?;
//! info!(boards = config.boards.len(), "Readout controller started");
//! # Ok(())
//! # }
//! ```

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for interactive bring-up)
    Pretty,
    /// Compact single-line format
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
            other => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                other
            )),
        }
    }
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level used when `RUST_LOG` is not set
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl TracingConfig {
    /// Compact output at `level`
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::Compact,
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }
}

/// Initialize tracing with custom configuration
///
/// Idempotent: a second call after a global subscriber is installed returns `Ok(())`.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    // One worker task per board, so thread names tell boards apart.
    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_names(true)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_thread_names(true)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_thread_names(true)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            // Either the dispatcher or the `log` bridge was installed first.
            let msg = e.to_string();
            if msg.contains("has already been set") || msg.contains("already initialized") {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
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

fn level_to_filter_string(level: Level) -> String {
    level.as_str().to_lowercase()
}
