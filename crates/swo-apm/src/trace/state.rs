use opentelemetry::trace::{SpanId, TraceFlags, TraceState};

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;

/// The `tracestate` list member key this vendor owns.
pub const VENDOR_KEY: &str = "sw";

/// Keys the agent stores inside `tracestate` for its own use. These never
/// leave the process on outbound requests; response propagators may surface
/// them to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalKey {
	XTraceOptionsResponse,
}

impl InternalKey {
	pub fn as_str(&self) -> &'static str {
		match self {
			InternalKey::XTraceOptionsResponse => "xtrace_options_response",
		}
	}
}

/// Parse a vendor entry value of the exact shape `<16 lowercase hex>-<2 hex>`.
///
/// Anything else, including an all-zero span id, is treated as "no upstream
/// state" and returns `None`.
pub fn parse_sw_state(value: &str) -> Option<(SpanId, TraceFlags)> {
	let (span_part, flags_part) = value.split_once('-')?;
	if span_part.len() != 16 || flags_part.len() != 2 {
		return None;
	}
	if !is_lower_hex(span_part) || !is_lower_hex(flags_part) {
		return None;
	}
	let span_id = SpanId::from_hex(span_part).ok()?;
	if span_id == SpanId::INVALID {
		return None;
	}
	let flags = u8::from_str_radix(flags_part, 16).ok()?;
	Some((span_id, TraceFlags::new(flags)))
}

/// Render the vendor entry for `span_id`. Only the sampled bit of `flags` is
/// carried; other flag bits are local concerns.
pub fn format_sw_state(span_id: SpanId, flags: TraceFlags) -> String {
	format!("{}-{:02x}", span_id, flags & TraceFlags::SAMPLED)
}

fn is_lower_hex(s: &str) -> bool {
	s
		.bytes()
		.all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Fetch an internal entry, reversing the escaping applied by
/// [`set_internal`]. Unescaping is total: any stored value round-trips.
pub fn get_internal(ts: &TraceState, key: InternalKey) -> Option<String> {
	ts.get(key.as_str()).map(unescape)
}

/// Store an internal entry. `tracestate` values may not contain `,` or `=`,
/// so both are replaced with reversible multi-character escapes.
pub fn set_internal(ts: &TraceState, key: InternalKey, value: &str) -> TraceState {
	match ts.insert(key.as_str(), escape(value)) {
		Ok(updated) => updated,
		Err(_) => ts.clone(),
	}
}

pub fn remove_internal(ts: &TraceState, key: InternalKey) -> TraceState {
	match ts.delete(key.as_str()) {
		Ok(updated) => updated,
		Err(_) => ts.clone(),
	}
}

const ESCAPED_COMMA: &str = "....";
const ESCAPED_EQUALS: &str = "####";

fn escape(value: &str) -> String {
	value
		.replace(',', ESCAPED_COMMA)
		.replace('=', ESCAPED_EQUALS)
}

fn unescape(value: &str) -> String {
	value
		.replace(ESCAPED_EQUALS, "=")
		.replace(ESCAPED_COMMA, ",")
}
