//! Tracing subscriber setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Install the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place and report that.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(config.ansi))
        .with(tracing_subscriber::filter::LevelFilter::from_level(config.tracing_level()))
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing subscriber already installed: {}", e))
}
