use commonware_runtime::{telemetry::metrics::status, Metrics as RuntimeMetrics};
use prometheus_client::metrics::gauge::Gauge;

/// Metrics for the [`Engine`](super::Engine)
#[derive(Default)]
pub struct Metrics {
    /// Number of flow starts by status
    pub start: status::Counter,
    /// Number of flow terminations by status
    pub finished: status::Counter,
    /// Number of inbound frames by status
    pub receive: status::Counter,
    /// Number of notary responses by status
    pub notarize: status::Counter,
    /// Number of live flows
    pub running: Gauge,
    /// Number of live sessions
    pub sessions: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Metrics::default();
        context.register(
            "start",
            "Number of flow starts by status",
            metrics.start.clone(),
        );
        context.register(
            "finished",
            "Number of flow terminations by status",
            metrics.finished.clone(),
        );
        context.register(
            "receive",
            "Number of inbound frames by status",
            metrics.receive.clone(),
        );
        context.register(
            "notarize",
            "Number of notary responses by status",
            metrics.notarize.clone(),
        );
        context.register("running", "Number of live flows", metrics.running.clone());
        context.register(
            "sessions",
            "Number of live sessions",
            metrics.sessions.clone(),
        );
        metrics
    }
}
