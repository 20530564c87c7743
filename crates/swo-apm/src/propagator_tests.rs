use std::collections::HashMap;

use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};

use super::*;

fn span_context(span: u64, sampled: bool, trace_state: TraceState) -> SpanContext {
	SpanContext::new(
		TraceId::from(0x1234),
		SpanId::from(span),
		if sampled {
			TraceFlags::SAMPLED
		} else {
			TraceFlags::default()
		},
		true,
		trace_state,
	)
}

fn sw_entry(carrier: &HashMap<String, String>) -> Option<String> {
	let header = carrier.get(TRACESTATE_HEADER)?;
	header
		.split(',')
		.find_map(|member| member.trim().strip_prefix("sw=").map(str::to_string))
}

#[test]
fn inject_writes_the_vendor_entry() {
	let propagator = SwoPropagator::new();
	let cx = Context::new().with_remote_span_context(span_context(
		0x00f0_67aa_0ba9_02b7,
		true,
		TraceState::default(),
	));
	let mut carrier = HashMap::new();
	propagator.inject_context(&cx, &mut carrier);
	assert_eq!(sw_entry(&carrier).as_deref(), Some("00f067aa0ba902b7-01"));
}

#[test]
fn inject_replaces_an_upstream_entry_and_keeps_other_vendors() {
	let propagator = SwoPropagator::new();
	let ts = TraceState::from_key_value([("sw", "aaaaaaaaaaaaaaaa-01"), ("other", "xyz")]).unwrap();
	let cx = Context::new().with_remote_span_context(span_context(0x0102_0304_0506_0708, false, ts));
	let mut carrier = HashMap::new();
	propagator.inject_context(&cx, &mut carrier);

	assert_eq!(sw_entry(&carrier).as_deref(), Some("0102030405060708-00"));
	assert!(carrier.get(TRACESTATE_HEADER).unwrap().contains("other=xyz"));
}

#[test]
fn inject_strips_the_options_response_entry() {
	let propagator = SwoPropagator::new();
	let ts = crate::trace::state::set_internal(
		&TraceState::default(),
		InternalKey::XTraceOptionsResponse,
		"trigger-trace=ok",
	);
	let cx = Context::new().with_remote_span_context(span_context(0x1, true, ts));
	let mut carrier = HashMap::new();
	propagator.inject_context(&cx, &mut carrier);

	let header = carrier.get(TRACESTATE_HEADER).unwrap();
	assert!(!header.contains(InternalKey::XTraceOptionsResponse.as_str()));
	assert!(header.contains("sw="));
}

#[test]
fn inject_without_a_valid_span_writes_nothing() {
	let propagator = SwoPropagator::new();
	let mut carrier = HashMap::new();
	propagator.inject_context(&Context::new(), &mut carrier);
	assert!(carrier.is_empty());
}

#[test]
fn inject_extract_is_identity_on_the_vendor_entry() {
	let propagator = SwoPropagator::new();
	let span_id = 0x00f0_67aa_0ba9_02b7u64;
	let ts = TraceState::from_key_value([("sw", "00f067aa0ba902b7-01")]).unwrap();
	let cx = Context::new().with_remote_span_context(span_context(span_id, true, ts.clone()));
	let mut carrier = HashMap::new();
	propagator.inject_context(&cx, &mut carrier);
	assert_eq!(
		sw_entry(&carrier).as_deref(),
		ts.get("sw"),
		"a context already carrying its own span's entry must round-trip"
	);
}

#[test]
fn extract_captures_the_option_headers() {
	let propagator = SwoPropagator::new();
	let mut carrier = HashMap::new();
	carrier.insert(
		OPTIONS_HEADER.to_string(),
		"trigger-trace;sw-keys=abc".to_string(),
	);
	carrier.insert(SIGNATURE_HEADER.to_string(), "deadbeef".to_string());

	let cx = propagator.extract_with_context(&Context::new(), &carrier);
	let bag = cx.get::<TraceOptionsBag>().unwrap();
	assert_eq!(bag.options.as_deref(), Some("trigger-trace;sw-keys=abc"));
	assert_eq!(bag.signature.as_deref(), Some("deadbeef"));
}

#[test]
fn extract_without_headers_leaves_the_context_untouched() {
	let propagator = SwoPropagator::new();
	let carrier = HashMap::new();
	let cx = propagator.extract_with_context(&Context::new(), &carrier);
	assert!(cx.get::<TraceOptionsBag>().is_none());
}

#[test]
fn fields_advertise_tracestate() {
	let propagator = SwoPropagator::new();
	let fields: Vec<&str> = propagator.fields().collect();
	assert_eq!(fields, vec![TRACESTATE_HEADER]);
}
