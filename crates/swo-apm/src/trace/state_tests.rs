use opentelemetry::trace::TraceState;

use super::*;

#[test]
fn parse_valid_entry() {
	let (span_id, flags) = parse_sw_state("aaaaaaaaaaaaaaaa-01").unwrap();
	assert_eq!(span_id, SpanId::from_hex("aaaaaaaaaaaaaaaa").unwrap());
	assert!(flags.is_sampled());

	let (_, flags) = parse_sw_state("00f067aa0ba902b7-00").unwrap();
	assert!(!flags.is_sampled());
}

#[test]
fn parse_rejects_malformed() {
	for input in [
		"",
		"-",
		"aaaaaaaaaaaaaaaa",
		"aaaaaaaaaaaaaaaa-1",
		"aaaaaaaaaaaaaaaa-001",
		"aaaaaaaaaaaaaaa-01",
		"AAAAAAAAAAAAAAAA-01",
		"aaaaaaaaaaaaaaaa-0G",
		"aaaaaaaaaaaaaaaa_01",
		"0000000000000000-01",
		"zzzzzzzzzzzzzzzz-01",
	] {
		assert!(parse_sw_state(input).is_none(), "{input:?} should not parse");
	}
}

#[test]
fn format_masks_to_sampled_bit() {
	let span_id = SpanId::from_hex("00f067aa0ba902b7").unwrap();
	assert_eq!(
		format_sw_state(span_id, TraceFlags::new(0xff)),
		"00f067aa0ba902b7-01"
	);
	assert_eq!(
		format_sw_state(span_id, TraceFlags::default()),
		"00f067aa0ba902b7-00"
	);
}

#[test]
fn format_parse_round_trip() {
	let span_id = SpanId::from_hex("0102030405060708").unwrap();
	let rendered = format_sw_state(span_id, TraceFlags::SAMPLED);
	let (parsed, flags) = parse_sw_state(&rendered).unwrap();
	assert_eq!(parsed, span_id);
	assert_eq!(flags, TraceFlags::SAMPLED);
}

#[test]
fn internal_state_round_trip() {
	let ts = TraceState::default();
	for value in [
		"trigger-trace=ok",
		"auth=ok;trigger-trace=rate-exceeded;ignored=foo,bar",
		"plain",
	] {
		let updated = set_internal(&ts, InternalKey::XTraceOptionsResponse, value);
		assert_eq!(
			get_internal(&updated, InternalKey::XTraceOptionsResponse).as_deref(),
			Some(value)
		);
	}
}

#[test]
fn internal_state_escapes_separators() {
	let ts = set_internal(
		&TraceState::default(),
		InternalKey::XTraceOptionsResponse,
		"trigger-trace=ok;ignored=a,b",
	);
	let raw = ts.get(InternalKey::XTraceOptionsResponse.as_str()).unwrap();
	assert!(!raw.contains('='));
	assert!(!raw.contains(','));
	assert!(raw.contains("####"));
	assert!(raw.contains("...."));
}

#[test]
fn remove_internal_state() {
	let ts = set_internal(&TraceState::default(), InternalKey::XTraceOptionsResponse, "ok");
	let cleared = remove_internal(&ts, InternalKey::XTraceOptionsResponse);
	assert!(get_internal(&cleared, InternalKey::XTraceOptionsResponse).is_none());

	// removing an absent key leaves the state untouched
	let again = remove_internal(&cleared, InternalKey::XTraceOptionsResponse);
	assert!(get_internal(&again, InternalKey::XTraceOptionsResponse).is_none());
}

#[test]
fn other_vendor_entries_survive() {
	let ts = TraceState::from_key_value([("other", "abc"), ("sw", "00f067aa0ba902b7-01")]).unwrap();
	let ts = set_internal(&ts, InternalKey::XTraceOptionsResponse, "trigger-trace=ok");
	assert_eq!(ts.get("other"), Some("abc"));
	assert_eq!(ts.get("sw"), Some("00f067aa0ba902b7-01"));
	let ts = remove_internal(&ts, InternalKey::XTraceOptionsResponse);
	assert_eq!(ts.get("other"), Some("abc"));
}
