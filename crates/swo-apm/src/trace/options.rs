use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha1::Sha1;

#[cfg(test)]
#[path = "options_tests.rs"]
mod tests;

/// Header names consumed on inbound requests.
pub const OPTIONS_HEADER: &str = "x-trace-options";
pub const SIGNATURE_HEADER: &str = "x-trace-options-signature";

/// Signatures are only honored while their timestamp is within this many
/// seconds of the local wall clock, in either direction.
pub const TIMESTAMP_WINDOW_SECS: i64 = 5 * 60;

type HmacSha1 = Hmac<Sha1>;

/// Parsed `x-trace-options` header.
///
/// The parser accepts any text and never fails; unrecognized or malformed
/// items end up in `ignored` and are echoed back to the caller through the
/// options response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XTraceOptions {
	pub trigger_trace: bool,
	pub sw_keys: String,
	pub custom_kvs: BTreeMap<String, String>,
	pub timestamp: i64,
	pub signature: String,
	pub ignored: Vec<String>,
}

impl XTraceOptions {
	/// Parse the raw header value. Items are `;`-separated `key` or
	/// `key=value` pairs; whitespace around keys and values is trimmed and
	/// empty items are skipped.
	pub fn parse(header: &str, signature: &str) -> Self {
		let mut opts = XTraceOptions {
			signature: signature.trim().to_string(),
			..Default::default()
		};
		for item in header.split(';') {
			let item = item.trim();
			if item.is_empty() {
				continue;
			}
			match item.split_once('=') {
				None => {
					// `trigger-trace` is the only valueless key.
					if item == "trigger-trace" {
						opts.trigger_trace = true;
					} else {
						opts.ignored.push(item.to_string());
					}
				},
				Some((key, value)) => {
					let key = key.trim();
					let value = value.trim();
					match key {
						"sw-keys" => opts.sw_keys = value.to_string(),
						"ts" => match value.parse::<i64>() {
							Ok(ts) => opts.timestamp = ts,
							Err(_) => opts.ignored.push(key.to_string()),
						},
						custom if custom.starts_with("custom-") && !custom.contains(' ') => {
							opts.custom_kvs.insert(custom.to_string(), value.to_string());
						},
						other => opts.ignored.push(other.to_string()),
					}
				},
			}
		}
		opts
	}

	pub fn has_signature(&self) -> bool {
		!self.signature.is_empty()
	}
}

/// Outcome of validating an options signature against the active
/// trigger-trace token. `response_value` strings are surfaced verbatim in
/// the `auth` key of the options response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureState {
	None,
	Valid,
	BadTimestamp,
	BadSignature,
	NoSignatureKey,
}

impl SignatureState {
	pub fn response_value(&self) -> &'static str {
		match self {
			SignatureState::None => "",
			SignatureState::Valid => "ok",
			SignatureState::BadTimestamp => "bad-timestamp",
			SignatureState::BadSignature => "bad-signature",
			SignatureState::NoSignatureKey => "no-signature-key",
		}
	}

	pub fn is_valid(&self) -> bool {
		matches!(self, SignatureState::Valid)
	}
}

/// Validate `signature` over the raw options header `payload`.
///
/// The timestamp window is checked first, then token availability, then the
/// HMAC itself, matching the precedence of the advertised failure strings.
pub fn validate_signature(
	payload: &str,
	signature: &str,
	token: Option<&[u8]>,
	timestamp: i64,
	now_unix: i64,
) -> SignatureState {
	if signature.is_empty() {
		return SignatureState::None;
	}
	if (now_unix - timestamp).abs() > TIMESTAMP_WINDOW_SECS {
		return SignatureState::BadTimestamp;
	}
	let Some(token) = token.filter(|t| !t.is_empty()) else {
		return SignatureState::NoSignatureKey;
	};
	if hmac_sha1_hex(token, payload.as_bytes()) == signature {
		SignatureState::Valid
	} else {
		SignatureState::BadSignature
	}
}

/// Lowercase hex HMAC-SHA1 digest of `data` under `key`.
pub fn hmac_sha1_hex(key: &[u8], data: &[u8]) -> String {
	let Ok(mut mac) = HmacSha1::new_from_slice(key) else {
		// HMAC accepts keys of any length; this arm is unreachable.
		return String::new();
	};
	mac.update(data);
	hex::encode(mac.finalize().into_bytes())
}
