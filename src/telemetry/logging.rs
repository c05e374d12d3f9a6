//! Structured JSON logging with an automatic field redactor.
//! Mission: every log line is a JSON record carrying timestamp, level,
//! target, and enclosing span name, with sensitive field values masked
//! before they're ever serialized — not scrubbed downstream by a log
//! shipper that might miss one.

use std::collections::HashSet;
use std::fmt;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Field names whose values are always masked in logs and error payloads.
/// Matching is case-insensitive and by substring, so `user_password`,
/// `apiKey`, `Authorization` all match.
pub fn default_sensitive_fields() -> HashSet<&'static str> {
    [
        "password",
        "token",
        "api_key",
        "apikey",
        "secret",
        "authorization",
        "access_token",
        "card_number",
        "ssn",
    ]
    .into_iter()
    .collect()
}

pub fn is_sensitive_field(name: &str, sensitive: &HashSet<&str>) -> bool {
    let lower = name.to_lowercase();
    sensitive.iter().any(|s| lower.contains(s))
}

/// Masks a value for a field name the redactor flagged as sensitive.
/// Card-number and SSN-shaped values are distinguished only by the field
/// name, matching the teacher-stack's field-driven masking approach.
pub fn redact(name: &str, value: &str) -> String {
    let sensitive = default_sensitive_fields();
    if is_sensitive_field(name, &sensitive) {
        "***REDACTED***".to_string()
    } else {
        value.to_string()
    }
}

/// Masks a free-form message (error text, log line) that might echo a
/// sensitive field name inline, since a message has no separate field name
/// of its own to check the way a structured log field does.
pub fn redact_message(message: &str) -> String {
    let sensitive = default_sensitive_fields();
    if is_sensitive_field(message, &sensitive) {
        "[redacted: message referenced a sensitive field]".to_string()
    } else {
        message.to_string()
    }
}

struct RedactingVisitor<'a> {
    sensitive: &'a HashSet<&'static str>,
    fields: Map<String, Value>,
}

impl<'a> RedactingVisitor<'a> {
    fn insert_str(&mut self, name: &str, value: &str) {
        let masked = if is_sensitive_field(name, self.sensitive) {
            "***REDACTED***".to_string()
        } else {
            value.to_string()
        };
        self.fields.insert(name.to_string(), Value::String(masked));
    }
}

impl<'a> Visit for RedactingVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert_str(field.name(), value);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert_str(field.name(), &format!("{value:?}"));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }
}

/// JSON event layer that redacts sensitive field values at the point
/// they're recorded, instead of composing with `tracing_subscriber::fmt`'s
/// built-in JSON formatter (which has no field-masking hook of its own).
pub struct RedactingJsonLayer {
    sensitive: HashSet<&'static str>,
}

impl RedactingJsonLayer {
    pub fn new() -> Self {
        Self {
            sensitive: default_sensitive_fields(),
        }
    }
}

impl Default for RedactingJsonLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for RedactingJsonLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut visitor = RedactingVisitor {
            sensitive: &self.sensitive,
            fields: Map::new(),
        };
        event.record(&mut visitor);

        let metadata = event.metadata();
        let mut record = Map::new();
        record.insert(
            "timestamp".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        record.insert(
            "level".to_string(),
            Value::String(metadata.level().to_string()),
        );
        record.insert(
            "target".to_string(),
            Value::String(metadata.target().to_string()),
        );
        if let Some(span) = ctx.event_span(event) {
            record.insert("span".to_string(), Value::String(span.name().to_string()));
        }
        record.insert("fields".to_string(), Value::Object(visitor.fields));

        println!("{}", Value::Object(record));
    }
}

/// Install the global tracing subscriber: JSON-formatted, env-filtered by
/// `log_level`, with sensitive fields masked before they print.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(RedactingJsonLayer::new())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_known_sensitive_names() {
        let sensitive = default_sensitive_fields();
        assert!(is_sensitive_field("Authorization", &sensitive));
        assert!(is_sensitive_field("user_api_key", &sensitive));
        assert!(is_sensitive_field("card_number", &sensitive));
        assert!(!is_sensitive_field("symbol", &sensitive));
    }

    #[test]
    fn redact_masks_sensitive_values_only() {
        assert_eq!(redact("password", "hunter2"), "***REDACTED***");
        assert_eq!(redact("symbol", "AAPL"), "AAPL");
    }

    #[test]
    fn redact_message_masks_whole_message_on_sensitive_hit() {
        assert_eq!(
            redact_message("invalid api_key supplied: abc123"),
            "[redacted: message referenced a sensitive field]"
        );
        assert_eq!(redact_message("order quantity must be positive"), "order quantity must be positive");
    }
}
