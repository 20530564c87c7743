use std::collections::{HashMap, HashSet};
use std::time::Duration;

use hdrhistogram::Histogram;
use opentelemetry::trace::{SpanKind, Status};
use opentelemetry::{Key, Value};
use opentelemetry_sdk::trace::SpanData;
use parking_lot::Mutex;
use url::Url;

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;

/// Overflow bucket for transaction names beyond the per-interval cap.
pub const OTHER_TRANSACTION: &str = "other";
pub const UNKNOWN_TRANSACTION: &str = "unknown";

const MAX_TRANSACTION_NAME_LEN: usize = 255;

mod semconv {
	pub const HTTP_METHOD: &[&str] = &["http.request.method", "http.method"];
	pub const HTTP_ROUTE: &str = "http.route";
	pub const HTTP_STATUS: &[&str] = &["http.response.status_code", "http.status_code"];
	pub const HTTP_URL: &[&str] = &["url.full", "http.url"];
}

/// Transaction-naming knobs resolved from configuration at startup.
#[derive(Debug, Default, Clone)]
pub struct NamingOptions {
	/// Fixed name for serverless deployments; beats everything else.
	pub default_name: Option<String>,
	pub prepend_domain: bool,
}

/// What the metrics aggregator needs to know about one finished span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanSummary {
	pub transaction: String,
	pub is_http: bool,
	pub method: Option<String>,
	pub status: Option<i64>,
	pub has_error: bool,
	pub duration: Duration,
}

impl SpanSummary {
	/// Classify a finished entry span and derive its transaction name.
	///
	/// Name precedence: configured serverless name, user override, the
	/// `http.route` attribute, the span name, the request URL path, then
	/// `"unknown"`.
	pub fn from_span(
		span: &SpanData,
		override_name: Option<&str>,
		naming: &NamingOptions,
	) -> SpanSummary {
		let method = attr_str(span, semconv::HTTP_METHOD);
		let is_http = span.span_kind == SpanKind::Server && method.is_some();
		let status = if is_http {
			attr_i64(span, semconv::HTTP_STATUS)
		} else {
			None
		};
		let has_error = matches!(span.status, Status::Error { .. })
			|| status.is_some_and(|code| code >= 500);
		let duration = span
			.end_time
			.duration_since(span.start_time)
			.unwrap_or_default();
		let transaction = derive_transaction_name(span, override_name, naming);
		SpanSummary {
			transaction,
			is_http,
			method: if is_http { method } else { None },
			status,
			has_error,
			duration,
		}
	}
}

fn derive_transaction_name(
	span: &SpanData,
	override_name: Option<&str>,
	naming: &NamingOptions,
) -> String {
	if let Some(name) = &naming.default_name
		&& !name.trim().is_empty()
	{
		return clean_transaction_name(name);
	}
	if let Some(name) = override_name.filter(|n| !n.trim().is_empty()) {
		return clean_transaction_name(name);
	}

	let url = attr_str(span, semconv::HTTP_URL).and_then(|raw| Url::parse(&raw).ok());
	let host = url.as_ref().and_then(|u| u.host_str().map(str::to_string));
	let derived = attr_str_one(span, semconv::HTTP_ROUTE)
		.filter(|r| !r.trim().is_empty())
		.or_else(|| {
			let name = span.name.trim();
			(!name.is_empty()).then(|| name.to_string())
		})
		.or_else(|| url.as_ref().map(|u| u.path().to_string()));

	match derived {
		Some(name) if naming.prepend_domain && host.is_some() => {
			clean_transaction_name(&format!("{}{}", host.unwrap_or_default(), name))
		},
		Some(name) => clean_transaction_name(&name),
		None => UNKNOWN_TRANSACTION.to_string(),
	}
}

fn clean_transaction_name(name: &str) -> String {
	let trimmed = name.trim();
	if trimmed.is_empty() {
		return UNKNOWN_TRANSACTION.to_string();
	}
	trimmed.chars().take(MAX_TRANSACTION_NAME_LEN).collect()
}

fn attr_str(span: &SpanData, keys: &[&str]) -> Option<String> {
	keys.iter().find_map(|k| attr_str_one(span, k))
}

fn attr_str_one(span: &SpanData, key: &str) -> Option<String> {
	let key = Key::new(key.to_string());
	span
		.attributes
		.iter()
		.find(|kv| kv.key == key)
		.map(|kv| match &kv.value {
			Value::String(s) => s.to_string(),
			other => other.to_string(),
		})
}

fn attr_i64(span: &SpanData, keys: &[&str]) -> Option<i64> {
	keys.iter().find_map(|k| {
		let key = Key::new(k.to_string());
		span.attributes.iter().find(|kv| kv.key == key).and_then(
			|kv| match &kv.value {
				Value::I64(v) => Some(*v),
				Value::String(s) => s.as_str().parse().ok(),
				_ => None,
			},
		)
	})
}

/// Tag set one latency measurement aggregates under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeasurementKey {
	pub transaction: String,
	pub method: Option<String>,
	pub status: Option<i64>,
	pub is_error: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeasurementValue {
	pub count: u64,
	pub sum_micros: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct HistogramSnapshot {
	/// Empty string is the all-transactions histogram.
	pub transaction: String,
	pub count: u64,
	pub min_micros: u64,
	pub max_micros: u64,
	pub p50_micros: u64,
	pub p95_micros: u64,
	pub p99_micros: u64,
}

/// One metrics-flush interval worth of inbound measurements.
#[derive(Debug, Default)]
pub struct InboundSnapshot {
	pub measurements: Vec<(MeasurementKey, MeasurementValue)>,
	pub histograms: Vec<HistogramSnapshot>,
	pub transaction_name_overflow: bool,
}

struct State {
	measurements: HashMap<MeasurementKey, MeasurementValue>,
	histograms: HashMap<String, Histogram<u64>>,
	names: HashSet<String>,
	overflow: bool,
}

impl State {
	fn new() -> Self {
		State {
			measurements: HashMap::new(),
			histograms: HashMap::new(),
			names: HashSet::new(),
			overflow: false,
		}
	}
}

/// Aggregates entry-span latency into tag-bucketed counters and HDR
/// histograms, bounding the distinct transaction names per interval.
pub struct InboundMetrics {
	precision: u8,
	state: Mutex<State>,
}

impl InboundMetrics {
	pub fn new(precision: u8) -> Self {
		InboundMetrics {
			precision: precision.min(5),
			state: Mutex::new(State::new()),
		}
	}

	/// Record one finished entry span. `max_transactions` is the active
	/// cap on distinct names for this interval.
	pub fn record(&self, summary: &SpanSummary, max_transactions: usize) {
		let mut state = self.state.lock();
		let transaction = if state.names.contains(&summary.transaction) {
			summary.transaction.clone()
		} else if state.names.len() < max_transactions {
			state.names.insert(summary.transaction.clone());
			summary.transaction.clone()
		} else {
			state.overflow = true;
			OTHER_TRANSACTION.to_string()
		};

		let micros = summary.duration.as_micros().min(u64::MAX as u128) as u64;
		let key = MeasurementKey {
			transaction: transaction.clone(),
			method: summary.method.clone(),
			status: summary.status,
			is_error: summary.has_error,
		};
		let value = state.measurements.entry(key).or_default();
		value.count += 1;
		value.sum_micros += micros;

		let precision = self.precision;
		for name in [String::new(), transaction] {
			state
				.histograms
				.entry(name)
				.or_insert_with(|| new_histogram(precision))
				.saturating_record(micros);
		}
	}

	/// Hand the interval's aggregates to a metrics flush and start a new
	/// interval (including a fresh name budget).
	pub fn flush(&self) -> InboundSnapshot {
		let state = {
			let mut guard = self.state.lock();
			std::mem::replace(&mut *guard, State::new())
		};
		InboundSnapshot {
			measurements: state.measurements.into_iter().collect(),
			histograms: state
				.histograms
				.into_iter()
				.map(|(transaction, h)| HistogramSnapshot {
					transaction,
					count: h.len(),
					min_micros: h.min(),
					max_micros: h.max(),
					p50_micros: h.value_at_quantile(0.50),
					p95_micros: h.value_at_quantile(0.95),
					p99_micros: h.value_at_quantile(0.99),
				})
				.collect(),
			transaction_name_overflow: state.overflow,
		}
	}

	pub fn reset(&self) {
		let _ = self.flush();
	}
}

fn new_histogram(precision: u8) -> Histogram<u64> {
	// auto-resizing histogram; precision is validated to 0..=5 upstream
	Histogram::new(precision).expect("histogram precision within 0..=5")
}
