use opentelemetry::trace::{SpanKind, Status};
use opentelemetry::{KeyValue, Value};
use opentelemetry_sdk::trace::SpanData;

use crate::reporter::{Event, unix_micros};

#[cfg(test)]
#[path = "exporter_tests.rs"]
mod tests;

/// Attribute keys that carry a full request URL and honor the
/// query-string reporting toggle.
const URL_KEYS: &[&str] = &["url.full", "http.url", "http.target"];

/// Render one finished, sampled span into backend events: an entry event,
/// one event per span event, and an exit event. With `report_query_string`
/// off, URL-shaped attributes lose their query part.
pub fn events_for_span(
	span: &SpanData,
	transaction_name: &str,
	report_query_string: bool,
) -> Vec<Event> {
	let layer = layer_name(span);
	let trace_context = trace_context_string(span);
	let mut events = Vec::with_capacity(2 + span.events.len());

	let mut entry = Event::new("entry", &layer);
	entry.timestamp_micros = unix_micros(span.start_time);
	entry.trace_context = trace_context.clone();
	entry.add("sw.span_name", span.name.as_ref());
	entry.add("sw.span_kind", kind_name(&span.span_kind));
	entry.add("otel.scope.name", span.instrumentation_scope.name().to_string());
	if !transaction_name.is_empty() {
		entry.add("TransactionName", transaction_name);
	}
	if span.parent_span_id != opentelemetry::trace::SpanId::INVALID {
		entry.add("sw.parent_span_id", span.parent_span_id.to_string());
	}
	for kv in &span.attributes {
		let value = attr_json(kv);
		let value = if !report_query_string && URL_KEYS.contains(&kv.key.as_str()) {
			strip_query(value)
		} else {
			value
		};
		entry.add(kv.key.as_str(), value);
	}
	events.push(entry);

	for span_event in span.events.iter() {
		let label = if span_event.name == "exception" {
			"error"
		} else {
			"info"
		};
		let mut info = Event::new(label, &layer);
		info.timestamp_micros = unix_micros(span_event.timestamp);
		info.trace_context = trace_context.clone();
		info.add("sw.event_name", span_event.name.to_string());
		for kv in &span_event.attributes {
			info.add(kv.key.as_str(), attr_json(kv));
		}
		events.push(info);
	}

	let mut exit = Event::new("exit", &layer);
	exit.timestamp_micros = unix_micros(span.end_time);
	exit.trace_context = trace_context;
	if let Status::Error { description } = &span.status {
		exit.add("sw.is_error", true);
		if !description.is_empty() {
			exit.add("sw.error_message", description.to_string());
		}
	}
	events.push(exit);
	events
}

fn layer_name(span: &SpanData) -> String {
	format!("{}:{}", kind_name(&span.span_kind), span.name)
}

fn kind_name(kind: &SpanKind) -> &'static str {
	match kind {
		SpanKind::Server => "SERVER",
		SpanKind::Client => "CLIENT",
		SpanKind::Producer => "PRODUCER",
		SpanKind::Consumer => "CONSUMER",
		SpanKind::Internal => "INTERNAL",
	}
}

/// Canonical `00-<trace_id>-<span_id>-<flags>` rendering, shared with the
/// legacy response header.
pub fn trace_context_string(span: &SpanData) -> String {
	let sc = &span.span_context;
	format!(
		"00-{}-{}-{:02x}",
		sc.trace_id(),
		sc.span_id(),
		sc.trace_flags() & opentelemetry::trace::TraceFlags::SAMPLED
	)
}

fn strip_query(value: serde_json::Value) -> serde_json::Value {
	match value {
		serde_json::Value::String(s) => {
			let stripped = s.split('?').next().unwrap_or("").to_string();
			serde_json::Value::String(stripped)
		},
		other => other,
	}
}

fn attr_json(kv: &KeyValue) -> serde_json::Value {
	match &kv.value {
		Value::Bool(v) => serde_json::Value::from(*v),
		Value::I64(v) => serde_json::Value::from(*v),
		Value::F64(v) => serde_json::Value::from(*v),
		Value::String(v) => serde_json::Value::from(v.as_str()),
		other => serde_json::Value::from(other.to_string()),
	}
}
