//! Metrics ring buffer and threshold-based alerting.
//! Mission: bounded-memory metric samples feeding alert rules that open
//! deduplicated incidents, independent of any external metrics backend.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use tracing::{error, warn};

use crate::events::{AlertSeverity as BusAlertSeverity, DomainEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

#[derive(Debug, Clone)]
pub struct MetricSample {
    pub kind: MetricKind,
    pub value: f64,
    pub recorded_at_ms: i64,
}

const MAX_SAMPLES_PER_NAME: usize = 512;

/// Per-name bounded-cardinality ring buffer of recent samples.
pub struct MetricsRegistry {
    series: RwLock<HashMap<String, VecDeque<MetricSample>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, name: &str, kind: MetricKind, value: f64, now_ms: i64) {
        // Mirror onto the process-wide Prometheus recorder installed in
        // `main` so `/metrics` reflects the same samples as the ring
        // buffer the alert pipeline reads from.
        match kind {
            MetricKind::Counter => metrics::counter!(name.to_string()).increment(value as u64),
            MetricKind::Gauge => metrics::gauge!(name.to_string()).set(value),
            MetricKind::Histogram => metrics::histogram!(name.to_string()).record(value),
        }

        let mut series = self.series.write();
        let buf = series.entry(name.to_string()).or_insert_with(VecDeque::new);
        buf.push_back(MetricSample {
            kind,
            value,
            recorded_at_ms: now_ms,
        });
        if buf.len() > MAX_SAMPLES_PER_NAME {
            buf.pop_front();
        }
    }

    pub fn counter(&self, name: &str, now_ms: i64) {
        self.record(name, MetricKind::Counter, 1.0, now_ms);
    }

    pub fn gauge(&self, name: &str, value: f64, now_ms: i64) {
        self.record(name, MetricKind::Gauge, value, now_ms);
    }

    pub fn histogram(&self, name: &str, value: f64, now_ms: i64) {
        self.record(name, MetricKind::Histogram, value, now_ms);
    }

    /// p95 over the samples within `window_ms` of `now_ms`.
    pub fn percentile(&self, name: &str, p: f64, now_ms: i64, window_ms: i64) -> Option<f64> {
        let series = self.series.read();
        let buf = series.get(name)?;
        let mut values: Vec<f64> = buf
            .iter()
            .filter(|s| now_ms - s.recorded_at_ms <= window_ms)
            .map(|s| s.value)
            .collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((values.len() as f64 * p).ceil() as usize).saturating_sub(1);
        values.get(idx).copied()
    }

    /// Count-based rate of non-zero samples (e.g. errors / total) over a
    /// window, counting occurrences rather than summing gauge values.
    pub fn rate(&self, name: &str, now_ms: i64, window_ms: i64) -> Option<f64> {
        let series = self.series.read();
        let buf = series.get(name)?;
        let windowed: Vec<&MetricSample> = buf
            .iter()
            .filter(|s| now_ms - s.recorded_at_ms <= window_ms)
            .collect();
        if windowed.is_empty() {
            return None;
        }
        let positives = windowed.iter().filter(|s| s.value > 0.0).count() as f64;
        Some(positives / windowed.len() as f64)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A breached threshold rule, deduplicated by `rule_id`.
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub rule_id: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct Incident {
    pub rule_id: String,
    pub message: String,
    pub severity: crate::error::Severity,
}

/// Destination for opened incidents. The default implementation just logs;
/// a real deployment would swap in a paging/Slack sink at this seam.
pub trait AlertSink: Send + Sync {
    fn notify(&self, incident: &Incident);
}

pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn notify(&self, incident: &Incident) {
        match incident.severity {
            crate::error::Severity::Critical | crate::error::Severity::High => {
                error!(alert_rule_id = %incident.rule_id, "{}", incident.message);
            }
            _ => {
                warn!(alert_rule_id = %incident.rule_id, "{}", incident.message);
            }
        }
    }
}

/// Sink that logs like `TracingAlertSink` and also publishes the incident
/// onto the event bus as a broadcast `DomainEvent::Alert`, so the streaming
/// hub fans it out to every open session instead of it staying server-side.
pub struct BusAlertSink {
    bus: EventBus,
}

impl BusAlertSink {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl AlertSink for BusAlertSink {
    fn notify(&self, incident: &Incident) {
        TracingAlertSink.notify(incident);
        let severity = match incident.severity {
            crate::error::Severity::Low => BusAlertSeverity::Low,
            crate::error::Severity::Medium => BusAlertSeverity::Medium,
            crate::error::Severity::High => BusAlertSeverity::High,
            crate::error::Severity::Critical => BusAlertSeverity::Critical,
        };
        let _ = self.bus.send(DomainEvent::Alert {
            user_id: None,
            id: uuid::Uuid::new_v4(),
            severity,
            title: incident.rule_id.clone(),
            body: incident.message.clone(),
            symbol: None,
        });
    }
}

/// Tracks which rule ids currently have an open incident so repeat
/// breaches don't re-notify until the rule clears.
pub struct AlertPipeline {
    sink: Box<dyn AlertSink>,
    open: RwLock<HashMap<String, Incident>>,
}

impl AlertPipeline {
    pub fn new(sink: Box<dyn AlertSink>) -> Self {
        Self {
            sink,
            open: RwLock::new(HashMap::new()),
        }
    }

    /// Evaluate one rule; `breached` is the already-computed boolean
    /// (callers build this from `MetricsRegistry::percentile`/`rate`).
    pub fn evaluate(&self, rule_id: &str, breached: bool, message: String, severity: crate::error::Severity) {
        let mut open = self.open.write();
        if breached {
            if !open.contains_key(rule_id) {
                let incident = Incident {
                    rule_id: rule_id.to_string(),
                    message,
                    severity,
                };
                self.sink.notify(&incident);
                open.insert(rule_id.to_string(), incident);
            }
        } else {
            open.remove(rule_id);
        }
    }

    pub fn open_incidents(&self) -> Vec<Incident> {
        self.open.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_over_window() {
        let reg = MetricsRegistry::new();
        for (i, v) in [10.0, 20.0, 30.0, 40.0, 50.0].into_iter().enumerate() {
            reg.histogram("latency_ms", v, i as i64 * 1000);
        }
        let p95 = reg.percentile("latency_ms", 0.95, 4000, 10_000).unwrap();
        assert_eq!(p95, 50.0);
    }

    #[test]
    fn alert_dedupes_while_open_and_clears() {
        let pipeline = AlertPipeline::new(Box::new(TracingAlertSink));
        pipeline.evaluate("rule.latency", true, "p95 high".into(), crate::error::Severity::High);
        pipeline.evaluate("rule.latency", true, "p95 high".into(), crate::error::Severity::High);
        assert_eq!(pipeline.open_incidents().len(), 1);

        pipeline.evaluate("rule.latency", false, "p95 high".into(), crate::error::Severity::High);
        assert_eq!(pipeline.open_incidents().len(), 0);
    }
}
