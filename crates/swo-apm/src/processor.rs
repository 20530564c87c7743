use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::Context;
use opentelemetry::trace::{Span as _, SpanId, TraceContextExt, TraceId};
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{Span, SpanData, SpanProcessor};
use parking_lot::Mutex;

use crate::entryspans::{EntrySpans, Parent};
use crate::exporter;
use crate::metrics::{InboundMetrics, NamingOptions, SpanSummary};
use crate::oboe::settings::{DEFAULT_MAX_TRANSACTIONS, SettingsStore};
use crate::reporter::Reporter;

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;

/// Drives the entry-span tracker on span start, and on span end feeds the
/// inbound metrics aggregator and hands sampled spans to the reporter as
/// events.
pub struct ApmSpanProcessor {
	tracker: Arc<dyn EntrySpans>,
	metrics: Arc<InboundMetrics>,
	settings: Arc<SettingsStore>,
	reporter: Arc<Reporter>,
	naming: NamingOptions,
	report_query_string: bool,
	entries: Mutex<HashSet<(TraceId, SpanId)>>,
}

impl fmt::Debug for ApmSpanProcessor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ApmSpanProcessor").finish()
	}
}

impl ApmSpanProcessor {
	pub fn new(
		tracker: Arc<dyn EntrySpans>,
		metrics: Arc<InboundMetrics>,
		settings: Arc<SettingsStore>,
		reporter: Arc<Reporter>,
		naming: NamingOptions,
		report_query_string: bool,
	) -> Self {
		ApmSpanProcessor {
			tracker,
			metrics,
			settings,
			reporter,
			naming,
			report_query_string,
			entries: Mutex::new(HashSet::new()),
		}
	}

	fn parent_kind(cx: &Context) -> Parent {
		let span = cx.span();
		let parent_sc = span.span_context();
		if !parent_sc.is_valid() {
			Parent::None
		} else if parent_sc.is_remote() {
			Parent::Remote
		} else {
			Parent::Local
		}
	}
}

impl SpanProcessor for ApmSpanProcessor {
	fn on_start(&self, span: &mut Span, cx: &Context) {
		let sc = span.span_context();
		let parent = Self::parent_kind(cx);
		if parent.is_entry() {
			self
				.entries
				.lock()
				.insert((sc.trace_id(), sc.span_id()));
			let _ = self.tracker.push(sc.trace_id(), sc.span_id(), parent);
		}
	}

	fn on_end(&self, span: SpanData) {
		let trace_id = span.span_context.trace_id();
		let span_id = span.span_context.span_id();
		let mut transaction_name = String::new();

		if self.entries.lock().remove(&(trace_id, span_id)) {
			let override_name = self.tracker.transaction_name(trace_id);
			let summary = SpanSummary::from_span(&span, override_name.as_deref(), &self.naming);
			let cap = self
				.settings
				.get("")
				.map(|s| s.max_transactions)
				.unwrap_or(DEFAULT_MAX_TRANSACTIONS);
			self.metrics.record(&summary, cap);
			let _ = self.tracker.delete(trace_id, span_id);
			transaction_name = summary.transaction;
		}

		if span.span_context.is_sampled() {
			for event in exporter::events_for_span(&span, &transaction_name, self.report_query_string) {
				self.reporter.report_event(event);
			}
		}
	}

	fn force_flush(&self) -> OTelSdkResult {
		// the reporter drains on its own cadence; a blocking flush here
		// would stall the SDK worker
		Ok(())
	}

	fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
		Ok(())
	}
}
