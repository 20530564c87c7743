//! End-to-end propagation: an inbound request with trigger-trace headers is
//! sampled, its context crosses to a downstream service over W3C headers,
//! and the downstream continues the decision instead of re-rolling.

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry::Context;
use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry::trace::{Span as _, SpanKind, TraceContextExt, Tracer as _, TracerProvider as _};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use swo_apm::oboe::settings::{SettingArgs, SettingFlags, SettingsStore};
use swo_apm::oboe::{LocalSettings, Oboe, settings::MAX_SAMPLE_RATE};
use swo_apm::propagator::SwoPropagator;
use swo_apm::sampler::SwoSampler;

fn agent_provider(args: SettingArgs) -> SdkTracerProvider {
	let store = Arc::new(SettingsStore::new());
	store.update(args.into());
	let oboe = Arc::new(Oboe::new(store, LocalSettings::default()));
	SdkTracerProvider::builder()
		.with_sampler(SwoSampler::new(oboe))
		.build()
}

fn propagator() -> TextMapCompositePropagator {
	TextMapCompositePropagator::new(vec![
		Box::new(TraceContextPropagator::new()),
		Box::new(SwoPropagator::new()),
	])
}

fn full_sampling_args() -> SettingArgs {
	SettingArgs {
		flags: SettingFlags::SAMPLE_START
			| SettingFlags::SAMPLE_THROUGH_ALWAYS
			| SettingFlags::TRIGGER_TRACE,
		sample_rate: MAX_SAMPLE_RATE,
		bucket_capacity: 8.0,
		bucket_rate: 4.0,
		tt_relaxed_capacity: 4.0,
		tt_relaxed_rate: 1.0,
		..Default::default()
	}
}

#[test]
fn trigger_trace_request_crosses_services() {
	let propagator = propagator();
	let provider = agent_provider(full_sampling_args());
	let tracer = provider.tracer("service-a");

	// inbound edge: client asked for a trigger trace
	let mut inbound = HashMap::new();
	inbound.insert("x-trace-options".to_string(), "trigger-trace".to_string());
	let cx = propagator.extract_with_context(&Context::new(), &inbound);

	let span = tracer
		.span_builder("GET /checkout")
		.with_kind(SpanKind::Server)
		.start_with_context(&tracer, &cx);
	assert!(span.span_context().is_sampled(), "trigger trace was granted");
	let span_id = span.span_context().span_id();
	let trace_id = span.span_context().trace_id();

	// outbound edge
	let cx = cx.with_span(span);
	let mut outbound = HashMap::new();
	propagator.inject_context(&cx, &mut outbound);

	let traceparent = outbound.get("traceparent").expect("traceparent injected");
	assert!(traceparent.starts_with("00-"));
	assert!(traceparent.contains(&trace_id.to_string()));
	assert!(traceparent.ends_with("-01"));

	let tracestate = outbound.get("tracestate").expect("tracestate injected");
	assert!(
		tracestate.contains(&format!("sw={span_id}-01")),
		"vendor entry carries the local span id: {tracestate}"
	);
	assert!(
		!tracestate.contains("xtrace_options_response"),
		"the options response must not leak downstream: {tracestate}"
	);

	// downstream service continues the same trace without new dice
	let provider_b = agent_provider(SettingArgs {
		// no SAMPLE_START: only continuation can sample here
		flags: SettingFlags::SAMPLE_THROUGH_ALWAYS,
		sample_rate: 0,
		bucket_capacity: 8.0,
		..Default::default()
	});
	let tracer_b = provider_b.tracer("service-b");
	let cx_b = propagator.extract_with_context(&Context::new(), &outbound);
	let span_b = tracer_b
		.span_builder("GET /inventory")
		.with_kind(SpanKind::Server)
		.start_with_context(&tracer_b, &cx_b);

	assert_eq!(span_b.span_context().trace_id(), trace_id);
	assert!(
		span_b.span_context().is_sampled(),
		"sample-through-always continues the upstream decision"
	);
}

#[test]
fn unsampled_decision_propagates_downstream() {
	let propagator = propagator();
	let provider = agent_provider(SettingArgs {
		flags: SettingFlags::SAMPLE_START | SettingFlags::SAMPLE_THROUGH_ALWAYS,
		sample_rate: 0,
		bucket_capacity: 8.0,
		..Default::default()
	});
	let tracer = provider.tracer("service-a");

	let span = tracer
		.span_builder("GET /healthz")
		.with_kind(SpanKind::Server)
		.start(&tracer);
	assert!(!span.span_context().is_sampled());
	let span_id = span.span_context().span_id();

	let cx = Context::new().with_span(span);
	let mut outbound = HashMap::new();
	propagator.inject_context(&cx, &mut outbound);
	let tracestate = outbound.get("tracestate").expect("tracestate injected");
	assert!(
		tracestate.contains(&format!("sw={span_id}-00")),
		"not-sampled bit propagates: {tracestate}"
	);

	// downstream in sample-through-always mode honors the refusal
	let provider_b = agent_provider(SettingArgs {
		flags: SettingFlags::SAMPLE_THROUGH_ALWAYS | SettingFlags::SAMPLE_START,
		sample_rate: MAX_SAMPLE_RATE,
		bucket_capacity: 8.0,
		..Default::default()
	});
	let tracer_b = provider_b.tracer("service-b");
	let cx_b = propagator.extract_with_context(&Context::new(), &outbound);
	let span_b = tracer_b
		.span_builder("GET /inventory")
		.with_kind(SpanKind::Server)
		.start_with_context(&tracer_b, &cx_b);
	assert!(
		!span_b.span_context().is_sampled(),
		"upstream refusal is continued, not re-rolled"
	);
}

#[test]
fn foreign_vendors_survive_the_hop() {
	let propagator = propagator();
	let provider = agent_provider(full_sampling_args());
	let tracer = provider.tracer("service-a");

	let mut inbound = HashMap::new();
	inbound.insert(
		"traceparent".to_string(),
		"00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
	);
	inbound.insert(
		"tracestate".to_string(),
		"congo=t61rcWkgMzE,sw=b7ad6b7169203331-01".to_string(),
	);
	let cx = propagator.extract_with_context(&Context::new(), &inbound);
	let span = tracer
		.span_builder("GET /cart")
		.with_kind(SpanKind::Server)
		.start_with_context(&tracer, &cx);
	assert_eq!(
		span.span_context().trace_id().to_string(),
		"0af7651916cd43dd8448eb211c80319c"
	);
	let span_id = span.span_context().span_id();

	let cx = cx.with_span(span);
	let mut outbound = HashMap::new();
	propagator.inject_context(&cx, &mut outbound);
	let tracestate = outbound.get("tracestate").expect("tracestate injected");
	assert!(tracestate.contains("congo=t61rcWkgMzE"), "{tracestate}");
	assert!(
		tracestate.contains(&format!("sw={span_id}-01")),
		"the vendor entry was re-stamped with the local span id: {tracestate}"
	);
	assert!(!tracestate.contains("b7ad6b7169203331-01"), "{tracestate}");
}
