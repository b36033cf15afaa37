//! Audit trail emitted through `tracing`.

use council_engine::{AuditSink, SinkError};
use serde_json::Value;

/// Longest string value kept in an audit record.
pub const MAX_AUDIT_FIELD_CHARS: usize = 500;

/// Writes every audit event on the `council::audit` target as one JSON
/// payload, so a JSON subscriber yields one parseable record per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log_event(&self, event: &str, data: &Value) -> Result<(), SinkError> {
        let payload = serde_json::to_string(&truncate_strings(data, MAX_AUDIT_FIELD_CHARS))?;
        tracing::info!(target: "council::audit", event, data = %payload);
        Ok(())
    }
}

/// Copy of `value` with every string (at any depth) cut to `max_chars`.
fn truncate_strings(value: &Value, max_chars: usize) -> Value {
    match value {
        Value::String(s) if s.chars().count() > max_chars => {
            let mut cut: String = s.chars().take(max_chars).collect();
            cut.push_str("...");
            Value::String(cut)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| truncate_strings(item, max_chars))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_strings(v, max_chars)))
                .collect(),
        ),
        other => other.clone(),
    }
}
