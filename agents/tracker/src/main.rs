//! The crossflow tracker agent.
//!
//! Observes cross-chain USDC flows (EVM ↔ Noble ↔ Namada) to terminal
//! status: chain pollers feed a per-flow tracking engine driven by a durable
//! worker pool, with flow state persisted relationally and status fanned out
//! over WebSocket.

#![forbid(unsafe_code)]

use eyre::Result;

use crossflow_base::{trace, Settings};

use crate::tracker::TrackerAgent;

mod engine;
mod queue;
mod server;
mod supervisor;
mod tracker;
mod worker;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    trace::start_tracing(settings.log_level)?;

    let agent = TrackerAgent::from_settings(settings).await?;
    agent.run().await
}
