//! Structured logging setup for applications embedding the SFU client
//!
//! The client crates only emit `tracing` events. The host application picks
//! an output format once at startup; `RUST_LOG` overrides the level.

use std::fmt;
use std::str::FromStr;
use tracing_subscriber::{
    fmt as fmt_layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

/// Crates whose events follow the configured level
const CLIENT_TARGETS: &[&str] = &["sfu_client", "sfu_config", "sfu_types"];

/// Output format of the global subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, for log shipping
    Json,
    /// Human-readable lines, for development
    Console,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "console" | "pretty" | "text" => Ok(LogFormat::Console),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Json => write!(f, "json"),
            LogFormat::Console => write!(f, "console"),
        }
    }
}

/// Filter directives: `level` for the client crates, `warn` for everything
/// else (transport, HTTP and TLS stacks are noisy at debug)
pub fn default_directives(level: &str) -> String {
    let mut directives = String::from("warn");
    for target in CLIENT_TARGETS {
        directives.push_str(&format!(",{}={}", target, level));
    }
    directives
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(default_level)))
}

/// Install the global subscriber for an application embedding the client
///
/// Fails if the application already installed one; the client keeps
/// logging through that subscriber.
pub fn init_logging(
    format: LogFormat,
    app_name: &str,
    default_level: &str,
) -> Result<(), TryInitError> {
    let registry = tracing_subscriber::registry().with(env_filter(default_level));
    match format {
        LogFormat::Json => registry
            .with(
                fmt_layer::layer()
                    .json()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .try_init()?,
        LogFormat::Console => registry
            .with(
                fmt_layer::layer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()?,
    }

    tracing::info!(
        app = app_name,
        format = %format,
        level = default_level,
        "Logging initialized"
    );
    Ok(())
}

/// Console subscriber writing through the test harness; later calls are
/// no-ops
pub fn try_init_test_logging(default_level: &str) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(fmt_layer::layer().with_test_writer())
        .try_init();
}
