//! tracing subscriber setup.
//!
//! Logs always go to stderr so that client commands can stream job output
//! on stdout untouched.

use std::str::FromStr;

use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Primary filter variable; `RUST_LOG` is consulted when it is unset.
pub const LOG_ENV: &str = "DEVJOBS_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// Resolve the filter directive: `DEVJOBS_LOG`, then `RUST_LOG`, then a
/// default that depends on `verbose`.
pub fn filter_directive(verbose: bool) -> String {
    [LOG_ENV, "RUST_LOG"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|v| !v.trim().is_empty())
        .unwrap_or_else(|| {
            if verbose {
                "devjobs=debug,info".to_string()
            } else {
                "devjobs=info,warn".to_string()
            }
        })
}

pub fn init_tracing(format: LogFormat, verbose: bool) -> Result<()> {
    let directive = filter_directive(verbose);
    let env_filter = EnvFilter::try_new(&directive)
        .map_err(|e| anyhow!("Invalid log filter '{}': {}", directive, e))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(verbose)
                    .compact(),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .with_current_span(false),
            )
            .try_init(),
    };
    result.map_err(|e| anyhow!("Failed to initialise logging: {}", e))
}
