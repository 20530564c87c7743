use std::sync::Arc;

use opentelemetry::trace::{
	Link, SamplingDecision, SamplingResult, SpanContext, SpanKind, TraceContextExt, TraceId,
};
use opentelemetry::{Context, KeyValue, Value};
use opentelemetry_sdk::trace::ShouldSample;

use crate::oboe::{Oboe, SampleDecision, SampleInput, Upstream, options_response};
use crate::propagator::TraceOptionsBag;
use crate::trace::options::XTraceOptions;
use crate::trace::state::{self, InternalKey, VENDOR_KEY};

#[cfg(test)]
#[path = "sampler_tests.rs"]
mod tests;

mod semconv {
	pub const HTTP_URL: &[&str] = &["url.full", "http.url"];
}

/// Bridges the host SDK's sampling callback to the decision engine and
/// translates its outcome into span attributes and `tracestate` mutations.
#[derive(Clone)]
pub struct SwoSampler {
	oboe: Arc<Oboe>,
}

impl std::fmt::Debug for SwoSampler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SwoSampler").finish()
	}
}

impl SwoSampler {
	pub fn new(oboe: Arc<Oboe>) -> Self {
		SwoSampler { oboe }
	}
}

impl ShouldSample for SwoSampler {
	fn should_sample(
		&self,
		parent_context: Option<&Context>,
		_trace_id: TraceId,
		_name: &str,
		_span_kind: &SpanKind,
		attributes: &[KeyValue],
		_links: &[Link],
	) -> SamplingResult {
		let parent_sc: Option<SpanContext> = parent_context
			.map(|cx| cx.span().span_context().clone())
			.filter(|sc| sc.is_valid());
		let remote_parent = parent_sc.as_ref().is_some_and(|sc| sc.is_remote());

		let sw_state = parent_sc
			.as_ref()
			.filter(|sc| sc.is_remote())
			.and_then(|sc| sc.trace_state().get(VENDOR_KEY).and_then(state::parse_sw_state));

		let bag = parent_context
			.and_then(|cx| cx.get::<TraceOptionsBag>())
			.cloned()
			.unwrap_or_default();
		let options_payload = bag.options.clone().unwrap_or_default();
		let options = bag
			.options
			.as_deref()
			.map(|header| XTraceOptions::parse(header, bag.signature.as_deref().unwrap_or("")));

		let url = attr_str(attributes, semconv::HTTP_URL).unwrap_or_default();
		let input = SampleInput {
			layer: "",
			url: &url,
			upstream: remote_parent.then_some(Upstream {
				sw_sampled: sw_state.map(|(_, flags)| flags.is_sampled()),
			}),
			options: options.as_ref(),
			options_payload: &options_payload,
		};
		let decision = self.oboe.sample(&input);

		let mut span_attributes = Vec::new();
		if let Some((upstream_span, _)) = sw_state {
			span_attributes.push(KeyValue::new(
				"sw.tracestate_parent_id",
				upstream_span.to_string(),
			));
		}
		if decision.trace {
			span_attributes.push(KeyValue::new("SampleRate", decision.rate as i64));
			span_attributes.push(KeyValue::new(
				"SampleSource",
				decision.source.as_i32() as i64,
			));
			span_attributes.push(KeyValue::new("BucketCapacity", decision.bucket_capacity));
			span_attributes.push(KeyValue::new("BucketRate", decision.bucket_rate));
		}

		// keep the upstream tracestate; the propagator stamps the local
		// span id onto the vendor entry at injection time
		let mut trace_state = parent_sc
			.as_ref()
			.map(|sc| sc.trace_state().clone())
			.unwrap_or_default();
		if let Some(opts) = &options {
			let response = options_response(opts, &decision);
			if !response.is_empty() {
				trace_state =
					state::set_internal(&trace_state, InternalKey::XTraceOptionsResponse, &response);
			}
		}

		SamplingResult {
			decision: to_otel_decision(&decision),
			attributes: span_attributes,
			trace_state,
		}
	}
}

fn to_otel_decision(decision: &SampleDecision) -> SamplingDecision {
	if decision.trace {
		SamplingDecision::RecordAndSample
	} else if decision.record_only {
		SamplingDecision::RecordOnly
	} else {
		SamplingDecision::Drop
	}
}

fn attr_str(attributes: &[KeyValue], keys: &[&str]) -> Option<String> {
	keys.iter().find_map(|key| {
		attributes
			.iter()
			.find(|kv| kv.key.as_str() == *key)
			.map(|kv| match &kv.value {
				Value::String(s) => s.to_string(),
				other => other.to_string(),
			})
	})
}
