use opentelemetry::trace::{SpanId, TraceFlags, TraceState};

use super::*;
use crate::oboe::settings::{SettingArgs, SettingFlags, SettingsStore};
use crate::oboe::{LocalSettings, settings::MAX_SAMPLE_RATE};
use crate::trace::options::hmac_sha1_hex;

const TOKEN: &[u8] = b"8mZ98ZnZhhggcsUmdMbS";

fn sampler_with(args: Option<SettingArgs>) -> (SwoSampler, Arc<Oboe>) {
	let store = Arc::new(SettingsStore::new());
	if let Some(args) = args {
		store.update(args.into());
	}
	let oboe = Arc::new(Oboe::new(store, LocalSettings::default()));
	(SwoSampler::new(oboe.clone()), oboe)
}

fn sampling_args() -> SettingArgs {
	SettingArgs {
		flags: SettingFlags::SAMPLE_START
			| SettingFlags::SAMPLE_THROUGH_ALWAYS
			| SettingFlags::TRIGGER_TRACE,
		sample_rate: MAX_SAMPLE_RATE,
		bucket_capacity: 8.0,
		bucket_rate: 4.0,
		tt_relaxed_capacity: 4.0,
		..Default::default()
	}
}

fn sample(sampler: &SwoSampler, parent: Option<&Context>, attrs: &[KeyValue]) -> SamplingResult {
	sampler.should_sample(
		parent,
		TraceId::from(0xabcd),
		"GET /cart",
		&SpanKind::Server,
		attrs,
		&[],
	)
}

fn remote_parent(sampled: bool, trace_state: TraceState) -> Context {
	Context::new().with_remote_span_context(SpanContext::new(
		TraceId::from(0xabcd),
		SpanId::from(0xaaaa_bbbb_cccc_dddd),
		if sampled {
			TraceFlags::SAMPLED
		} else {
			TraceFlags::default()
		},
		true,
		trace_state,
	))
}

#[test]
fn no_settings_means_record_only() {
	let (sampler, _) = sampler_with(None);
	let result = sample(&sampler, None, &[]);
	assert_eq!(result.decision, SamplingDecision::RecordOnly);
	assert!(result.attributes.is_empty());
}

#[test]
fn root_span_at_full_rate_is_sampled_with_attributes() {
	let (sampler, _) = sampler_with(Some(sampling_args()));
	let result = sample(&sampler, None, &[]);
	assert_eq!(result.decision, SamplingDecision::RecordAndSample);

	let attr = |key: &str| {
		result
			.attributes
			.iter()
			.find(|kv| kv.key.as_str() == key)
			.map(|kv| kv.value.clone())
	};
	assert_eq!(attr("SampleRate"), Some(Value::I64(MAX_SAMPLE_RATE as i64)));
	assert_eq!(attr("SampleSource"), Some(Value::I64(2)));
	assert_eq!(attr("BucketCapacity"), Some(Value::F64(8.0)));
	assert_eq!(attr("BucketRate"), Some(Value::F64(4.0)));
	assert!(attr("sw.tracestate_parent_id").is_none());
}

#[test]
fn sampled_upstream_with_vendor_state_is_continued() {
	let (sampler, oboe) = sampler_with(Some(sampling_args()));
	let ts = TraceState::from_key_value([("sw", "aaaabbbbccccdddd-01")]).unwrap();
	let parent = remote_parent(true, ts);
	let result = sample(&sampler, Some(&parent), &[]);

	assert_eq!(result.decision, SamplingDecision::RecordAndSample);
	let parent_attr = result
		.attributes
		.iter()
		.find(|kv| kv.key.as_str() == "sw.tracestate_parent_id")
		.expect("upstream span id surfaced");
	assert_eq!(parent_attr.value.to_string(), "aaaabbbbccccdddd");

	let counts = oboe.counters().swap_and_reset();
	assert_eq!(counts.regular.through, 1);
	assert_eq!(counts.regular.sampled, 0, "no dice on continuation");
}

#[test]
fn unsampled_upstream_stays_unsampled() {
	let (sampler, _) = sampler_with(Some(sampling_args()));
	let ts = TraceState::from_key_value([("sw", "aaaabbbbccccdddd-00")]).unwrap();
	let parent = remote_parent(false, ts);
	let result = sample(&sampler, Some(&parent), &[]);
	assert_eq!(result.decision, SamplingDecision::RecordOnly);
}

#[test]
fn malformed_vendor_state_falls_back_to_dice() {
	let (sampler, oboe) = sampler_with(Some(sampling_args()));
	let ts = TraceState::from_key_value([("sw", "not-a-valid-entry")]).unwrap();
	let parent = remote_parent(true, ts);
	let result = sample(&sampler, Some(&parent), &[]);
	assert_eq!(result.decision, SamplingDecision::RecordAndSample);
	let counts = oboe.counters().swap_and_reset();
	assert_eq!(counts.regular.sampled, 1, "dice were rolled");
	assert_eq!(counts.regular.through, 0);
}

#[test]
fn trigger_trace_response_lands_in_trace_state() {
	let (sampler, _) = sampler_with(Some(sampling_args()));
	let parent = Context::new().with_value(crate::propagator::TraceOptionsBag {
		options: Some("trigger-trace".to_string()),
		signature: None,
	});
	let result = sample(&sampler, Some(&parent), &[]);
	assert_eq!(result.decision, SamplingDecision::RecordAndSample);
	assert_eq!(
		state::get_internal(&result.trace_state, InternalKey::XTraceOptionsResponse).as_deref(),
		Some("trigger-trace=ok")
	);
}

#[test]
fn signed_trigger_trace_advertises_auth_ok() {
	let (sampler, _) = sampler_with(Some(SettingArgs {
		signature_token: TOKEN.to_vec(),
		tt_strict_capacity: 2.0,
		..sampling_args()
	}));
	let ts = std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap()
		.as_secs();
	let payload = format!("trigger-trace;ts={ts}");
	let signature = hmac_sha1_hex(TOKEN, payload.as_bytes());
	let parent = Context::new().with_value(crate::propagator::TraceOptionsBag {
		options: Some(payload),
		signature: Some(signature),
	});
	let result = sample(&sampler, Some(&parent), &[]);
	assert_eq!(result.decision, SamplingDecision::RecordAndSample);
	assert_eq!(
		state::get_internal(&result.trace_state, InternalKey::XTraceOptionsResponse).as_deref(),
		Some("auth=ok;trigger-trace=ok")
	);
}

#[test]
fn upstream_trace_state_is_preserved() {
	let (sampler, _) = sampler_with(Some(sampling_args()));
	let ts =
		TraceState::from_key_value([("other", "abc"), ("sw", "aaaabbbbccccdddd-01")]).unwrap();
	let parent = remote_parent(true, ts);
	let result = sample(&sampler, Some(&parent), &[]);
	assert_eq!(result.trace_state.get("other"), Some("abc"));
	assert_eq!(result.trace_state.get("sw"), Some("aaaabbbbccccdddd-01"));
}

#[test]
fn url_attribute_feeds_transaction_filters() {
	let store = Arc::new(SettingsStore::new());
	store.update(sampling_args().into());
	let oboe = Arc::new(Oboe::new(
		store,
		LocalSettings {
			transaction_filters: vec![crate::oboe::TransactionFilter {
				matcher: crate::oboe::UrlMatcher::Regex(regex::Regex::new("^https://.*/health").unwrap()),
				mode: crate::oboe::TracingMode::Disabled,
			}],
			..Default::default()
		},
	));
	let sampler = SwoSampler::new(oboe);

	let result = sample(
		&sampler,
		None,
		&[KeyValue::new("http.url", "https://api.example.com/health")],
	);
	assert_eq!(result.decision, SamplingDecision::RecordOnly);

	let result = sample(
		&sampler,
		None,
		&[KeyValue::new("http.url", "https://api.example.com/cart")],
	);
	assert_eq!(result.decision, SamplingDecision::RecordAndSample);
}
