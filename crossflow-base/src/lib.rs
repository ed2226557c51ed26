//! Ambient stack shared by crossflow agents: layered settings loading,
//! tracing initialisation, Prometheus metrics, the sea-orm flow store and
//! the in-process status event bus.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use events::StatusEventBus;
pub use metrics::CoreMetrics;
pub use settings::{Settings, TracingLevel};

pub mod db;
mod events;
mod metrics;
mod settings;
pub mod trace;
