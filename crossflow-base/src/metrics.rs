use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "crossflow";

/// Prometheus instruments shared across the tracker.
#[derive(Debug)]
pub struct CoreMetrics {
    registry: Registry,
    /// Flows registered through the API.
    pub flows_created: IntCounter,
    /// Stages confirmed, labelled by chain and stage symbol.
    pub stages_confirmed: IntCounterVec,
    /// Flows reaching a terminal status, labelled by status.
    pub flows_terminal: IntCounterVec,
    /// Wall-clock seconds spent polling one stage, labelled by chain.
    pub stage_poll_duration: HistogramVec,
    /// Jobs currently queued or running.
    pub queue_depth: IntGauge,
    /// Open WebSocket connections.
    pub ws_connections: IntGauge,
}

impl CoreMetrics {
    /// Create and register all instruments on a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let flows_created = IntCounter::with_opts(
            Opts::new("flows_created_total", "Flows registered through the API")
                .namespace(NAMESPACE),
        )?;
        let stages_confirmed = IntCounterVec::new(
            Opts::new("stages_confirmed_total", "Stages confirmed by pollers")
                .namespace(NAMESPACE),
            &["chain", "stage"],
        )?;
        let flows_terminal = IntCounterVec::new(
            Opts::new("flows_terminal_total", "Flows reaching a terminal status")
                .namespace(NAMESPACE),
            &["status"],
        )?;
        let stage_poll_duration = HistogramVec::new(
            HistogramOpts::new("stage_poll_duration_seconds", "Wall-clock time per stage poll")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0]),
            &["chain"],
        )?;
        let queue_depth = IntGauge::with_opts(
            Opts::new("queue_depth", "Jobs currently queued or running").namespace(NAMESPACE),
        )?;
        let ws_connections = IntGauge::with_opts(
            Opts::new("ws_connections", "Open WebSocket connections").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(flows_created.clone()))?;
        registry.register(Box::new(stages_confirmed.clone()))?;
        registry.register(Box::new(flows_terminal.clone()))?;
        registry.register(Box::new(stage_poll_duration.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(ws_connections.clone()))?;

        Ok(Self {
            registry,
            flows_created,
            stages_confirmed,
            flows_terminal,
            stage_poll_duration,
            queue_depth,
            ws_connections,
        })
    }

    /// Gather all metrics as Prometheus text exposition format.
    pub fn gather(&self) -> prometheus::Result<Vec<u8>> {
        let collected = self.registry.gather();
        let mut out = Vec::with_capacity(16 * 1024);
        TextEncoder::new().encode(&collected, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_exposes_registered_metrics() {
        let metrics = CoreMetrics::new().unwrap();
        metrics.flows_created.inc();
        metrics
            .stages_confirmed
            .with_label_values(&["noble", "noble_cctp_minted"])
            .inc();

        let text = String::from_utf8(metrics.gather().unwrap()).unwrap();
        assert!(text.contains("crossflow_flows_created_total"));
        assert!(text.contains("noble_cctp_minted"));
    }
}
