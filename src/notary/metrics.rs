use commonware_runtime::{telemetry::metrics::status, Metrics as RuntimeMetrics};
use prometheus_client::metrics::gauge::Gauge;

/// Metrics for the [`Engine`](super::Engine)
#[derive(Default)]
pub struct Metrics {
    /// Number of notarization requests by status
    pub notarize: status::Counter,
    /// Number of inputs currently marked as consumed
    pub consumed: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Metrics::default();
        context.register(
            "notarize",
            "Number of notarization requests by status",
            metrics.notarize.clone(),
        );
        context.register(
            "consumed",
            "Number of inputs currently marked as consumed",
            metrics.consumed.clone(),
        );
        metrics
    }
}
