//! Reliability substrate: correlation ids, structured logging, and the
//! metrics/alert pipeline shared by every engine (§4.4).

pub mod correlation;
pub mod logging;
pub mod metrics;

pub use correlation::{correlation_id, CorrelationId, CORRELATION_HEADER};
pub use metrics::{AlertPipeline, AlertSink, BusAlertSink, MetricKind, MetricsRegistry, TracingAlertSink};
