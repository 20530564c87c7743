use std::sync::Arc;
use std::time::Duration;

use opentelemetry::trace::{Span as _, SpanKind, Status, Tracer as _, TracerProvider as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{SdkTracerProvider, Span, SpanData, SpanProcessor};
use parking_lot::Mutex;

/// Collects finished spans so tests can inspect real SDK-built `SpanData`.
#[derive(Debug, Clone, Default)]
pub struct CaptureProcessor {
	pub spans: Arc<Mutex<Vec<SpanData>>>,
}

impl SpanProcessor for CaptureProcessor {
	fn on_start(&self, _span: &mut Span, _cx: &Context) {}

	fn on_end(&self, span: SpanData) {
		self.spans.lock().push(span);
	}

	fn force_flush(&self) -> OTelSdkResult {
		Ok(())
	}

	fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
		Ok(())
	}
}

/// Run one span through a private tracer provider and return its data.
pub fn finished_span(
	name: &'static str,
	kind: SpanKind,
	attributes: Vec<KeyValue>,
	status: Status,
) -> SpanData {
	let capture = CaptureProcessor::default();
	let provider = SdkTracerProvider::builder()
		.with_span_processor(capture.clone())
		.build();
	let tracer = provider.tracer("swo-apm-test");
	let mut span = tracer
		.span_builder(name)
		.with_kind(kind)
		.with_attributes(attributes)
		.start(&tracer);
	span.set_status(status);
	span.end();
	let span = capture.spans.lock().pop();
	span.expect("span should have been captured")
}

/// Same span, with its duration pinned for latency assertions.
pub fn finished_span_with_duration(
	name: &'static str,
	kind: SpanKind,
	attributes: Vec<KeyValue>,
	status: Status,
	duration: Duration,
) -> SpanData {
	let mut span = finished_span(name, kind, attributes, status);
	span.end_time = span.start_time + duration;
	span
}
