//! Logging bootstrap
//!
//! Installs a global `tracing` subscriber for embedding processes. The
//! filter comes from `RUST_LOG` with the given level as an extra directive.

use std::fmt;
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::EnvFilter;

use syncmesh_core::SyncError;

/// Output format of the global subscriber
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Plain => "plain",
            LogFormat::Json => "json",
        })
    }
}

impl FromStr for LogFormat {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            other => Err(SyncError::InvalidConfig(format!("unknown log format: {other:?}"))),
        }
    }
}

/// Install the global subscriber at `INFO`
///
/// Returns `false` when a subscriber was already installed; the existing
/// one is kept.
pub fn init_tracing(format: LogFormat) -> bool {
    init_tracing_with_level(format, Level::INFO)
}

/// Install the global subscriber at `level`
pub fn init_tracing_with_level(format: LogFormat, level: Level) -> bool {
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(true);
    let installed = match format {
        LogFormat::Plain => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    };
    if installed {
        tracing::info!(%format, %level, "logging initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Plain".parse::<LogFormat>().unwrap(), LogFormat::Plain);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_second_init_keeps_first() {
        let _ = init_tracing(LogFormat::Plain);
        assert!(!init_tracing(LogFormat::Json));
    }
}
