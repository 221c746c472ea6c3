//! Telemetry facade.
//!
//! Components receive the facade through [`crate::state::AppState`] rather
//! than touching process-wide recorders, so tests and `DISABLE_TELEMETRY`
//! runs swap in the no-op implementation. The metrics-backed implementation
//! emits through the `metrics` facade; exporter wiring is an operational
//! concern.

use std::sync::Arc;
use std::time::Duration;

pub trait Telemetry: Send + Sync {
    /// Monitor: time from snapshot arrival to bus publish completion.
    fn publish_duration(&self, elapsed: Duration);

    /// Broadcast worker: time from bus delivery to session dispatch.
    fn receive_duration(&self, elapsed: Duration);

    /// A broadcast session superseded its local track with a new epoch.
    fn epoch_swap(&self);

    /// Health endpoint invocation.
    fn ping(&self);
}

pub struct MetricsTelemetry {
    namespace: String,
}

impl MetricsTelemetry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn name(&self, suffix: &str) -> String {
        format!("{}.{}", self.namespace, suffix)
    }
}

impl Telemetry for MetricsTelemetry {
    fn publish_duration(&self, elapsed: Duration) {
        metrics::histogram!(self.name("monitor.publish.duration"))
            .record(elapsed.as_millis() as f64);
    }

    fn receive_duration(&self, elapsed: Duration) {
        metrics::histogram!(self.name("broadcast.receive.duration"))
            .record(elapsed.as_millis() as f64);
    }

    fn epoch_swap(&self) {
        metrics::counter!(self.name("broadcast.epoch.swaps")).increment(1);
    }

    fn ping(&self) {
        metrics::counter!(self.name("server.invocation.counter")).increment(1);
    }
}

pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn publish_duration(&self, _elapsed: Duration) {}
    fn receive_duration(&self, _elapsed: Duration) {}
    fn epoch_swap(&self) {}
    fn ping(&self) {}
}

/// Select the facade implementation for the given configuration.
pub fn for_namespace(namespace: &str, disabled: bool) -> Arc<dyn Telemetry> {
    if disabled {
        Arc::new(NoopTelemetry)
    } else {
        Arc::new(MetricsTelemetry::new(namespace))
    }
}
