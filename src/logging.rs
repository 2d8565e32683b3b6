//! Tracing/logging configuration for webtrack
//!
//! Supports:
//! - Multiple verbosity levels: default (WARN), verbose (INFO), debug (DEBUG), quiet (ERROR)
//! - Pretty (colored), JSON, or compact output formats

use std::sync::OnceLock;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Log output format
#[derive(Clone, Debug, Default, clap::ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Colored human-readable output
    #[default]
    Pretty,
    /// Structured JSON output (one JSON object per line)
    Json,
    /// Compact single-line format
    Compact,
}

/// Tracing configuration built from CLI args
pub struct TracingConfig {
    /// Verbose mode (INFO level)
    pub verbose: bool,
    /// Debug mode (DEBUG level)
    pub debug: bool,
    /// Quiet mode (ERROR only)
    pub quiet: bool,
    /// Output format
    pub format: LogFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            debug: false,
            quiet: false,
            format: LogFormat::Pretty,
        }
    }
}

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize tracing with the given configuration.
///
/// This should be called early in main() after CLI args are parsed.
/// If called multiple times, subsequent calls are ignored.
pub fn init_tracing(config: TracingConfig) {
    // Only initialize once
    if TRACING_INITIALIZED.get().is_some() {
        return;
    }

    let level = if config.quiet {
        Level::ERROR
    } else if config.debug {
        Level::DEBUG
    } else if config.verbose {
        Level::INFO
    } else {
        Level::WARN
    };

    // CLI args take precedence over RUST_LOG
    let cli_log_level_specified = config.verbose || config.debug || config.quiet;
    let filter = if cli_log_level_specified {
        EnvFilter::new(format!("webtrack={},warn", level.as_str().to_lowercase()))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("webtrack={},warn", level.as_str().to_lowercase()))
        })
    };

    match config.format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_ansi(true)
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::fmt()
                .compact()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
    }

    let _ = TRACING_INITIALIZED.set(());
}
