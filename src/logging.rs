// Structured logging setup
//
// Builds the global tracing subscriber from LoggingConfig. RUST_LOG takes
// precedence over the configured level.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Build the env filter for `level`, honouring RUST_LOG when set
pub fn env_filter(level: tracing::Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

/// Install the global tracing subscriber
///
/// # Errors
///
/// Returns an error if the level or format is unknown or a global subscriber
/// is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let level: tracing::Level = config
        .level
        .to_lowercase()
        .parse()
        .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr);

    let result = match config.format.to_lowercase().as_str() {
        "json" => builder.json().try_init(),
        "pretty" => builder.pretty().try_init(),
        "compact" => builder.compact().try_init(),
        other => anyhow::bail!("Invalid log format: {}", other),
    };

    result.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
