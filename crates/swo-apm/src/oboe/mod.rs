use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::trace::options::{SignatureState, XTraceOptions, validate_signature};

pub mod bucket;
pub mod counters;
pub mod settings;

use counters::{Outcome, RequestClass, RequestCounters};
use settings::{MAX_SAMPLE_RATE, Setting, SettingFlags, SettingType, SettingsStore};

#[cfg(test)]
#[path = "oboe_tests.rs"]
mod tests;

/// Values advertised through the `trigger-trace` key of the options
/// response.
pub const RSP_OK: &str = "ok";
pub const RSP_RATE_EXCEEDED: &str = "rate-exceeded";
pub const RSP_NOT_REQUESTED: &str = "not-requested";
pub const RSP_TRACING_DISABLED: &str = "tracing-disabled";
pub const RSP_TRIGGER_TRACING_DISABLED: &str = "trigger-tracing-disabled";
pub const RSP_SETTINGS_NOT_AVAILABLE: &str = "settings-not-available";

/// How the caller asked for a trigger trace, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerTraceMode {
	NotPresent,
	Invalid,
	Relaxed,
	Strict,
}

impl TriggerTraceMode {
	pub fn derive(options: Option<&XTraceOptions>, signature: SignatureState) -> Self {
		let Some(opts) = options else {
			return TriggerTraceMode::NotPresent;
		};
		if !opts.trigger_trace {
			return TriggerTraceMode::NotPresent;
		}
		match signature {
			SignatureState::None => TriggerTraceMode::Relaxed,
			SignatureState::Valid => TriggerTraceMode::Strict,
			_ => TriggerTraceMode::Invalid,
		}
	}

	pub fn requested(self) -> bool {
		!matches!(self, TriggerTraceMode::NotPresent)
	}

	fn request_class(self) -> RequestClass {
		match self {
			TriggerTraceMode::Relaxed => RequestClass::RelaxedTriggerTrace,
			TriggerTraceMode::Strict => RequestClass::StrictTriggerTrace,
			_ => RequestClass::Regular,
		}
	}
}

/// Where the effective sample rate came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SampleSource {
	#[default]
	None,
	File,
	DefaultSetting,
	LayerSetting,
	Unset,
}

impl SampleSource {
	pub fn as_i32(self) -> i32 {
		match self {
			SampleSource::None => 0,
			SampleSource::File => 1,
			SampleSource::DefaultSetting => 2,
			SampleSource::LayerSetting => 3,
			SampleSource::Unset => -1,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingMode {
	Enabled,
	Disabled,
}

#[derive(Debug, Clone)]
pub enum UrlMatcher {
	Regex(regex::Regex),
	Extensions(Vec<String>),
}

impl UrlMatcher {
	fn matches(&self, url: &str) -> bool {
		match self {
			UrlMatcher::Regex(re) => re.is_match(url),
			UrlMatcher::Extensions(exts) => {
				let path = url.split(['?', '#']).next().unwrap_or(url);
				exts
					.iter()
					.any(|ext| path.ends_with(&format!(".{ext}")))
			},
		}
	}
}

/// Per-URL tracing-mode override from configuration. First match wins.
#[derive(Debug, Clone)]
pub struct TransactionFilter {
	pub matcher: UrlMatcher,
	pub mode: TracingMode,
}

/// Local configuration overrides folded into every decision.
#[derive(Debug)]
pub struct LocalSettings {
	pub tracing_mode: Option<TracingMode>,
	pub sample_rate: Option<i32>,
	pub trigger_trace: bool,
	pub transaction_filters: Vec<TransactionFilter>,
}

impl Default for LocalSettings {
	fn default() -> Self {
		LocalSettings {
			tracing_mode: None,
			sample_rate: None,
			trigger_trace: true,
			transaction_filters: Vec::new(),
		}
	}
}

impl LocalSettings {
	fn mode_for_url(&self, url: &str) -> Option<TracingMode> {
		if url.is_empty() {
			return self.tracing_mode;
		}
		self
			.transaction_filters
			.iter()
			.find(|f| f.matcher.matches(url))
			.map(|f| f.mode)
			.or(self.tracing_mode)
	}
}

/// Upstream distributed-tracing context, already validated by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct Upstream {
	/// Sampled bit of the upstream vendor entry, when one was present and
	/// parseable.
	pub sw_sampled: Option<bool>,
}

/// Inputs for one sampling decision.
#[derive(Debug, Default)]
pub struct SampleInput<'a> {
	pub layer: &'a str,
	pub url: &'a str,
	pub upstream: Option<Upstream>,
	pub options: Option<&'a XTraceOptions>,
	/// Raw options header; the signature is computed over these bytes.
	pub options_payload: &'a str,
}

/// Outcome of one sampling decision.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleDecision {
	pub trace: bool,
	pub record_only: bool,
	pub rate: i32,
	pub source: SampleSource,
	pub enabled: bool,
	pub bucket_capacity: f64,
	pub bucket_rate: f64,
	pub dice_rolled: bool,
	/// `trigger-trace` status advertised back to the caller; empty when the
	/// signature itself was rejected (the auth state is surfaced instead).
	pub xtrace_options_response: String,
	pub signature_state: SignatureState,
}

impl SampleDecision {
	fn refuse(response: &str) -> Self {
		SampleDecision {
			trace: false,
			record_only: true,
			rate: 0,
			source: SampleSource::None,
			enabled: false,
			bucket_capacity: 0.0,
			bucket_rate: 0.0,
			dice_rolled: false,
			xtrace_options_response: response.to_string(),
			signature_state: SignatureState::None,
		}
	}
}

/// The policy-driven per-trace decision machine.
///
/// Holds the remotely delivered settings, the local overrides and the
/// request counters; owns no I/O.
pub struct Oboe {
	settings: Arc<SettingsStore>,
	counters: Arc<RequestCounters>,
	local: LocalSettings,
}

impl Oboe {
	pub fn new(settings: Arc<SettingsStore>, local: LocalSettings) -> Self {
		Oboe {
			settings,
			counters: Arc::new(RequestCounters::new()),
			local,
		}
	}

	pub fn counters(&self) -> Arc<RequestCounters> {
		self.counters.clone()
	}

	pub fn settings(&self) -> Arc<SettingsStore> {
		self.settings.clone()
	}

	pub fn sample(&self, input: &SampleInput) -> SampleDecision {
		let setting = self.settings.get(input.layer);
		let signature_state = self.signature_state(input, setting.as_deref());
		let mode = TriggerTraceMode::derive(input.options, signature_state);
		let class = mode.request_class();

		let mut outcome = Outcome::default();
		let mut decision = self.decide(input, setting.as_deref(), mode, &mut outcome);
		decision.signature_state = signature_state;
		self.counters.record(class, outcome);
		decision
	}

	fn signature_state(&self, input: &SampleInput, setting: Option<&Setting>) -> SignatureState {
		let Some(opts) = input.options else {
			return SignatureState::None;
		};
		if !opts.has_signature() {
			return SignatureState::None;
		}
		validate_signature(
			input.options_payload,
			&opts.signature,
			setting.and_then(|s| s.token()),
			opts.timestamp,
			unix_now(),
		)
	}

	fn decide(
		&self,
		input: &SampleInput,
		setting: Option<&Setting>,
		mode: TriggerTraceMode,
		outcome: &mut Outcome,
	) -> SampleDecision {
		let Some(setting) = setting else {
			return SampleDecision::refuse(RSP_SETTINGS_NOT_AVAILABLE);
		};

		let url_mode = self.local.mode_for_url(input.url);
		let flags_allow_anything = setting.flags.contains(SettingFlags::SAMPLE_START)
			|| setting.flags.contains(SettingFlags::SAMPLE_THROUGH_ALWAYS)
			|| setting.flags.contains(SettingFlags::TRIGGER_TRACE);
		if url_mode == Some(TracingMode::Disabled) || !flags_allow_anything {
			return SampleDecision::refuse(RSP_TRACING_DISABLED);
		}

		if mode == TriggerTraceMode::Invalid {
			let mut decision = SampleDecision::refuse("");
			decision.enabled = true;
			return decision;
		}

		if mode.requested() {
			return self.decide_trigger_trace(setting, mode, outcome);
		}

		let (rate, source) = self.effective_rate(setting);
		if let Some(upstream) = input.upstream
			&& setting.flags.contains(SettingFlags::SAMPLE_THROUGH_ALWAYS)
			&& let Some(sw_sampled) = upstream.sw_sampled
		{
			return self.decide_through(setting, sw_sampled, rate, source, outcome);
		}

		if setting.flags.contains(SettingFlags::SAMPLE_START) {
			return self.decide_dice(setting, rate, source, outcome);
		}

		let mut decision = SampleDecision::refuse(RSP_NOT_REQUESTED);
		decision.enabled = true;
		decision.rate = rate;
		decision.source = source;
		decision
	}

	fn decide_trigger_trace(
		&self,
		setting: &Setting,
		mode: TriggerTraceMode,
		outcome: &mut Outcome,
	) -> SampleDecision {
		if !self.local.trigger_trace || !setting.flags.contains(SettingFlags::TRIGGER_TRACE) {
			let mut decision = SampleDecision::refuse(RSP_TRIGGER_TRACING_DISABLED);
			decision.enabled = true;
			decision.rate = -1;
			decision.source = SampleSource::Unset;
			return decision;
		}
		let bucket = match mode {
			TriggerTraceMode::Relaxed => &setting.tt_relaxed_bucket,
			_ => &setting.tt_strict_bucket,
		};
		let granted = bucket.take(1.0);
		outcome.triggered = granted;
		outcome.limited = !granted;
		outcome.traced = granted;
		SampleDecision {
			trace: granted,
			record_only: !granted,
			rate: -1,
			source: SampleSource::Unset,
			enabled: true,
			bucket_capacity: bucket.capacity(),
			bucket_rate: bucket.rate(),
			dice_rolled: false,
			xtrace_options_response: if granted { RSP_OK } else { RSP_RATE_EXCEEDED }.to_string(),
			signature_state: SignatureState::None,
		}
	}

	fn decide_through(
		&self,
		setting: &Setting,
		sw_sampled: bool,
		rate: i32,
		source: SampleSource,
		outcome: &mut Outcome,
	) -> SampleDecision {
		let (trace, bucket) = if sw_sampled {
			outcome.through = true;
			let granted = setting.main_bucket.take(1.0);
			outcome.limited = !granted;
			(granted, Some(&setting.main_bucket))
		} else {
			(false, None)
		};
		outcome.traced = trace;
		SampleDecision {
			trace,
			record_only: !trace,
			rate,
			source,
			enabled: true,
			bucket_capacity: bucket.map(|b| b.capacity()).unwrap_or_default(),
			bucket_rate: bucket.map(|b| b.rate()).unwrap_or_default(),
			dice_rolled: false,
			xtrace_options_response: RSP_NOT_REQUESTED.to_string(),
			signature_state: SignatureState::None,
		}
	}

	fn decide_dice(
		&self,
		setting: &Setting,
		rate: i32,
		source: SampleSource,
		outcome: &mut Outcome,
	) -> SampleDecision {
		let roll = rand::rng().random_range(0..MAX_SAMPLE_RATE);
		let chosen = roll < rate;
		outcome.sampled = chosen;
		let trace = if chosen {
			let granted = setting.main_bucket.take(1.0);
			outcome.limited = !granted;
			granted
		} else {
			false
		};
		outcome.traced = trace;
		SampleDecision {
			trace,
			record_only: !trace,
			rate,
			source,
			enabled: true,
			bucket_capacity: setting.main_bucket.capacity(),
			bucket_rate: setting.main_bucket.rate(),
			dice_rolled: true,
			xtrace_options_response: RSP_NOT_REQUESTED.to_string(),
			signature_state: SignatureState::None,
		}
	}

	/// Fold the locally configured sample rate into the remote one. The
	/// `OVERRIDE` flag lets the collector cap a local override; without it
	/// a configured local rate wins outright.
	fn effective_rate(&self, setting: &Setting) -> (i32, SampleSource) {
		let remote_source = match &setting.setting_type {
			SettingType::Default => SampleSource::DefaultSetting,
			SettingType::Layer(_) => SampleSource::LayerSetting,
		};
		match self.local.sample_rate {
			None => (setting.sample_rate, remote_source),
			Some(local) => {
				let local = local.clamp(0, MAX_SAMPLE_RATE);
				if setting.flags.contains(SettingFlags::OVERRIDE) && setting.sample_rate < local {
					(setting.sample_rate, remote_source)
				} else {
					(local, SampleSource::File)
				}
			},
		}
	}
}

/// Assemble the `x-trace-options-response` advertisement for one decision.
/// Key order: `auth`, `trigger-trace`, `ignored`.
pub fn options_response(opts: &XTraceOptions, decision: &SampleDecision) -> String {
	let mut parts = Vec::with_capacity(3);
	if opts.has_signature() {
		parts.push(format!("auth={}", decision.signature_state.response_value()));
	}
	let auth_failed = !matches!(
		decision.signature_state,
		SignatureState::None | SignatureState::Valid
	);
	if !auth_failed {
		let status = if opts.trigger_trace {
			decision.xtrace_options_response.as_str()
		} else {
			RSP_NOT_REQUESTED
		};
		parts.push(format!("trigger-trace={status}"));
	}
	if !opts.ignored.is_empty() {
		parts.push(format!("ignored={}", opts.ignored.join(",")));
	}
	parts.join(";")
}

fn unix_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as i64)
		.unwrap_or_default()
}
