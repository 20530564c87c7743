use once_cell::sync::Lazy;
use opentelemetry::Context;
use opentelemetry::propagation::text_map_propagator::FieldIter;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::TraceContextExt;

use crate::trace::options::{OPTIONS_HEADER, SIGNATURE_HEADER};
use crate::trace::state::{self, InternalKey, VENDOR_KEY};

#[cfg(test)]
#[path = "propagator_tests.rs"]
mod tests;

pub const TRACESTATE_HEADER: &str = "tracestate";

static FIELDS: Lazy<[String; 1]> = Lazy::new(|| [TRACESTATE_HEADER.to_string()]);

/// Request-scoped header slots filled at extraction and consumed by the
/// sampler. Malformed or absent headers simply leave the slots empty.
#[derive(Debug, Clone, Default)]
pub struct TraceOptionsBag {
	pub options: Option<String>,
	pub signature: Option<String>,
}

/// Vendor-side W3C propagation: owns the `sw` entry of `tracestate` on the
/// way out and captures the trigger-trace headers on the way in. The W3C
/// `traceparent` itself is handled by the standard trace-context propagator
/// composed next to this one.
#[derive(Debug, Clone, Default)]
pub struct SwoPropagator;

impl SwoPropagator {
	pub fn new() -> Self {
		SwoPropagator
	}
}

impl TextMapPropagator for SwoPropagator {
	fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
		let span = cx.span();
		let sc = span.span_context();
		if !sc.is_valid() {
			return;
		}
		let ts = sc.trace_state();
		let entry = state::format_sw_state(sc.span_id(), sc.trace_flags());
		let ts = match ts.insert(VENDOR_KEY, entry) {
			Ok(updated) => updated,
			Err(_) => ts.clone(),
		};
		// the options response is for the caller, never for downstream
		let ts = state::remove_internal(&ts, InternalKey::XTraceOptionsResponse);
		injector.set(TRACESTATE_HEADER, ts.header());
	}

	fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
		let options = extractor.get(OPTIONS_HEADER).map(str::to_string);
		let signature = extractor.get(SIGNATURE_HEADER).map(str::to_string);
		if options.is_none() && signature.is_none() {
			return cx.clone();
		}
		cx.with_value(TraceOptionsBag { options, signature })
	}

	fn fields(&self) -> FieldIter<'_> {
		FieldIter::new(FIELDS.as_slice())
	}
}
