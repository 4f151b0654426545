//! Logging initialization for the daemon binaries.

use std::str::FromStr;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::id::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(thiserror::Error, Debug)]
#[error("unrecognized log format '{0}', expected one of: plain, json")]
pub struct ParseLogFormatError(String);

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<LogFormat, Self::Err> {
        match s {
            "plain" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            other => Err(ParseLogFormatError(other.to_owned())),
        }
    }
}

/// Install the global `tracing` subscriber and log a startup banner for
/// `node`.
///
/// The filter comes from `RUST_LOG` when set and defaults to info-level
/// otherwise. Events go to stderr, tagged with the emitting thread's name:
/// the op shard worker threads are named after their shard, which keeps
/// interleaved scheduler logs attributable to a queue.
pub fn init(format: LogFormat, node: NodeId) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_thread_names(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("{e}"))
    .context("failed to install the tracing subscriber")?;

    info!(
        osd = %node,
        version = env!("CARGO_PKG_VERSION"),
        format = ?format,
        "logging initialized"
    );
    Ok(())
}
