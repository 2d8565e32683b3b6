//! Configuration for the webtrack CLI and demo server.
//!
//! Everything is settable via CLI flags or environment variables; there is
//! deliberately no config file, the surface is small.

use std::path::PathBuf;

use clap::Args;

use crate::logging::{LogFormat, TracingConfig};

/// Common configuration arguments (used across CLI commands)
#[derive(Args, Clone, Debug)]
pub struct ConfigArgs {
    /// Path to the SQLite tracking database
    #[arg(long = "db", env = "WEBTRACK_DB", value_name = "PATH", default_value = "webtrack.db")]
    pub db: PathBuf,

    /// Port for the demo server
    #[arg(long, short = 'p', env = "WEBTRACK_PORT")]
    pub port: Option<u16>,

    /// Application identifier stamped on tracked calls (e.g., "web" or "ios")
    #[arg(long, env = "WEBTRACK_APP", default_value = "web")]
    pub app: String,

    /// Secret key authenticating the client-identity cookie.
    ///
    /// When set, cookie values carry an HMAC-SHA256 tag and tampered values
    /// are treated as absent. When unset, cookies hold the plain base-36 id.
    #[arg(long, env = "WEBTRACK_COOKIE_SECRET", value_name = "SECRET")]
    pub cookie_secret: Option<String>,

    /// Fail requests with 500 when a tracking write fails.
    ///
    /// Off by default: tracking errors are logged and the request proceeds,
    /// so a tracking outage cannot become an application outage. Turning
    /// this on changes availability semantics.
    #[arg(long, env = "WEBTRACK_STRICT")]
    pub strict_tracking: bool,

    /// Verbose output (INFO level)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Debug output (DEBUG level)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Only log errors
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    pub log_format: LogFormat,
}

impl ConfigArgs {
    pub fn tracing_config(&self) -> TracingConfig {
        TracingConfig {
            verbose: self.verbose,
            debug: self.debug,
            quiet: self.quiet,
            format: self.log_format.clone(),
        }
    }
}
