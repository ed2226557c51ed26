//! Tracing subscriber setup.

use eyre::Result;
use serde::Deserialize;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::prelude::*;

/// Logging level, deserialized from `LOG_LEVEL`.
#[derive(Default, Debug, Clone, Copy, Deserialize, PartialOrd, Ord, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TracingLevel {
    /// Off
    Off = 0,
    /// Error
    Error = 1,
    /// Warn
    Warn = 2,
    /// Debug
    Debug = 3,
    /// Trace
    Trace = 5,
    /// Info
    #[serde(other)]
    #[default]
    Info = 4,
}

impl From<TracingLevel> for LevelFilter {
    fn from(level: TracingLevel) -> LevelFilter {
        match level {
            TracingLevel::Off => LevelFilter::OFF,
            TracingLevel::Error => LevelFilter::ERROR,
            TracingLevel::Warn => LevelFilter::WARN,
            TracingLevel::Debug => LevelFilter::DEBUG,
            TracingLevel::Trace => LevelFilter::TRACE,
            TracingLevel::Info => LevelFilter::INFO,
        }
    }
}

/// Install the global tracing subscriber.
///
/// Noise from trusted transport and storage dependencies is capped below the
/// configured level so agent logs stay readable at debug.
pub fn start_tracing(level: TracingLevel) -> Result<()> {
    let mut target_layer = Targets::new().with_default(level);

    if level < TracingLevel::Trace {
        target_layer = target_layer
            .with_target("hyper", TracingLevel::Info)
            .with_target("reqwest", TracingLevel::Info)
            .with_target("tokio", TracingLevel::Debug)
            .with_target("sqlx::query", TracingLevel::Warn);
    }

    let subscriber = tracing_subscriber::Registry::default()
        .with(target_layer)
        .with(tracing_subscriber::fmt::layer());

    subscriber.try_init()?;
    Ok(())
}
