use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

use crate::oboe::{LocalSettings, TracingMode, TransactionFilter, UrlMatcher};

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

pub const DEFAULT_COLLECTOR: &str = "apm.collector.cloud.solarwinds.com:443";

/// Configuration files larger than this are rejected outright.
const MAX_CONFIG_FILE_BYTES: u64 = 1024 * 1024;

const ENV_PREFIX: &str = "SW_APM_";

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("invalid service key: expected `<token>:<service-name>`, got {}", mask_service_key(.0))]
	InvalidServiceKey(String),

	#[error("config file {0} exceeds 1MiB")]
	ConfigFileTooLarge(String),

	#[error("failed to read config file {path}: {source}")]
	ConfigFileUnreadable {
		path: String,
		source: std::io::Error,
	},

	#[error("failed to parse config file {path}: {source}")]
	ConfigFileInvalid {
		path: String,
		source: serde_yaml::Error,
	},
}

/// The service key is the collector credential: `<token>:<service-name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceKey {
	pub token: String,
	pub service_name: String,
}

impl ServiceKey {
	fn parse(raw: &str) -> Option<ServiceKey> {
		let (token, name) = raw.split_once(':')?;
		let token = token.trim();
		let name = name.trim();
		if token.is_empty() || name.is_empty() {
			return None;
		}
		Some(ServiceKey {
			token: token.to_string(),
			// the collector treats service names as case-insensitive;
			// normalize here so metrics keys agree with it
			service_name: name.to_lowercase(),
		})
	}

	/// `token:name` form for the wire.
	pub fn as_wire(&self) -> String {
		format!("{}:{}", self.token, self.service_name)
	}
}

/// Redact the token part of a service key for log output.
pub fn mask_service_key(raw: &str) -> String {
	let token = raw.split(':').next().unwrap_or(raw);
	let masked = if token.len() <= 8 {
		"*".repeat(token.len())
	} else {
		format!("{}****{}", &token[..4], &token[token.len() - 4..])
	};
	match raw.split_once(':') {
		Some((_, name)) => format!("{masked}:{name}"),
		None => masked,
	}
}

/// Diagnostic log verbosity, settable at runtime through the facade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DebugLevel {
	Debug,
	#[default]
	Info,
	Warn,
	Error,
}

impl DebugLevel {
	fn parse(raw: &str) -> Option<DebugLevel> {
		match raw.to_lowercase().as_str() {
			"debug" => Some(DebugLevel::Debug),
			"info" => Some(DebugLevel::Info),
			"warn" => Some(DebugLevel::Warn),
			"error" => Some(DebugLevel::Error),
			_ => None,
		}
	}

	pub fn as_filter(self) -> tracing_subscriber::filter::LevelFilter {
		use tracing_subscriber::filter::LevelFilter;
		match self {
			DebugLevel::Debug => LevelFilter::DEBUG,
			DebugLevel::Info => LevelFilter::INFO,
			DebugLevel::Warn => LevelFilter::WARN,
			DebugLevel::Error => LevelFilter::ERROR,
		}
	}
}

/// Fully resolved agent configuration. Environment variables win over the
/// YAML file; invalid individual values are logged and ignored.
#[derive(Debug)]
pub struct Config {
	pub enabled: bool,
	pub service_key: Option<ServiceKey>,
	pub collector: String,
	pub trusted_path: Option<PathBuf>,
	pub proxy: Option<String>,
	pub proxy_cert_path: Option<PathBuf>,
	pub tracing_mode: Option<TracingMode>,
	pub sample_rate: Option<i32>,
	pub trigger_trace: bool,
	pub token_bucket_capacity: Option<f64>,
	pub token_bucket_rate: Option<f64>,
	pub hostname_alias: Option<String>,
	pub histogram_precision: u8,
	pub debug_level: DebugLevel,
	pub report_query_string: bool,
	pub prepend_domain: bool,
	/// Fixed transaction name for serverless environments.
	pub transaction_name: Option<String>,
	pub transaction_settings: Vec<TransactionFilter>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			enabled: true,
			service_key: None,
			collector: DEFAULT_COLLECTOR.to_string(),
			trusted_path: None,
			proxy: None,
			proxy_cert_path: None,
			tracing_mode: None,
			sample_rate: None,
			trigger_trace: true,
			token_bucket_capacity: None,
			token_bucket_rate: None,
			hostname_alias: None,
			histogram_precision: 2,
			debug_level: DebugLevel::default(),
			report_query_string: true,
			prepend_domain: false,
			transaction_name: None,
			transaction_settings: Vec::new(),
		}
	}
}

impl Config {
	/// Load from the process environment plus the YAML file named by
	/// `SW_APM_CONFIG_FILE`, if any.
	pub fn load() -> Result<Config, Error> {
		let env: HashMap<String, String> = std::env::vars()
			.filter(|(k, _)| k.starts_with(ENV_PREFIX))
			.collect();
		let file = match env.get("SW_APM_CONFIG_FILE") {
			Some(path) => Some(read_config_file(path)?),
			None => None,
		};
		Self::from_parts(&env, file.as_deref())
	}

	/// Resolution core, separated from process state for tests.
	fn from_parts(env: &HashMap<String, String>, yaml: Option<&str>) -> Result<Config, Error> {
		let mut cfg = Config::default();
		if let Some(yaml) = yaml {
			let file: ConfigFile = serde_yaml::from_str(yaml).map_err(|source| {
				Error::ConfigFileInvalid {
					path: env
						.get("SW_APM_CONFIG_FILE")
						.cloned()
						.unwrap_or_default(),
					source,
				}
			})?;
			cfg.apply_file(file);
		}
		cfg.apply_env(env);

		if let Some(raw) = env
			.get("SW_APM_SERVICE_KEY")
			.cloned()
			.or_else(|| cfg.service_key.as_ref().map(ServiceKey::as_wire))
		{
			match ServiceKey::parse(&raw) {
				Some(key) => cfg.service_key = Some(key),
				None => return Err(Error::InvalidServiceKey(raw)),
			}
		}
		Ok(cfg)
	}

	fn apply_file(&mut self, file: ConfigFile) {
		if let Some(collector) = file.collector {
			self.collector = collector;
		}
		if let Some(raw) = file.service_key {
			self.service_key = ServiceKey::parse(&raw);
			if self.service_key.is_none() {
				warn!(key = %mask_service_key(&raw), "ignoring malformed ServiceKey in config file");
			}
		}
		if let Some(path) = file.trusted_path {
			self.trusted_path = Some(PathBuf::from(path));
		}
		if let Some(sampling) = file.sampling {
			if let Some(mode) = sampling.tracing_mode {
				self.tracing_mode = parse_tracing_mode(&mode);
			}
			if let Some(rate) = sampling.sample_rate {
				self.sample_rate = validate_sample_rate(rate);
			}
		}
		if let Some(v) = file.prepend_domain {
			self.prepend_domain = v;
		}
		if let Some(alias) = file.host_alias {
			self.hostname_alias = Some(alias);
		}
		if let Some(precision) = file.precision {
			if precision <= 5 {
				self.histogram_precision = precision;
			} else {
				warn!(precision, "ignoring Precision outside 0..=5");
			}
		}
		if let Some(v) = file.report_query_string {
			self.report_query_string = v;
		}
		if let Some(v) = file.trigger_trace {
			self.trigger_trace = v;
		}
		if let Some(level) = file.debug_level {
			match DebugLevel::parse(&level) {
				Some(level) => self.debug_level = level,
				None => warn!(level = %level, "ignoring unknown DebugLevel"),
			}
		}
		if let Some(proxy) = file.proxy {
			self.proxy = Some(proxy);
		}
		for (i, entry) in file.transaction_settings.into_iter().enumerate() {
			match entry.into_filter() {
				Ok(filter) => self.transaction_settings.push(filter),
				Err(reason) => warn!(index = i, reason, "ignoring TransactionSettings entry"),
			}
		}
	}

	fn apply_env(&mut self, env: &HashMap<String, String>) {
		let get = |name: &str| env.get(&format!("{ENV_PREFIX}{name}"));
		if let Some(v) = get("ENABLED") {
			match parse_bool(v) {
				Some(enabled) => self.enabled = enabled,
				None => warn!(value = %v, "ignoring non-boolean SW_APM_ENABLED"),
			}
		}
		if let Some(v) = get("COLLECTOR") {
			self.collector = v.clone();
		}
		if let Some(v) = get("TRUSTEDPATH") {
			self.trusted_path = Some(PathBuf::from(v));
		}
		if let Some(v) = get("PROXY") {
			self.proxy = Some(v.clone());
		}
		if let Some(v) = get("PROXY_CERT_PATH") {
			self.proxy_cert_path = Some(PathBuf::from(v));
		}
		if let Some(v) = get("TRACING_MODE") {
			match parse_tracing_mode(v) {
				Some(mode) => self.tracing_mode = Some(mode),
				None => warn!(value = %v, "ignoring unknown SW_APM_TRACING_MODE"),
			}
		}
		if let Some(v) = get("SAMPLE_RATE") {
			match v.parse::<i32>().ok().and_then(validate_sample_rate) {
				Some(rate) => self.sample_rate = Some(rate),
				None => warn!(value = %v, "ignoring SW_APM_SAMPLE_RATE outside 0..=1000000"),
			}
		}
		if let Some(v) = get("TOKEN_BUCKET_CAPACITY") {
			match v.parse::<f64>().ok().filter(|c| (0.0..=8.0).contains(c)) {
				Some(cap) => self.token_bucket_capacity = Some(cap),
				None => warn!(value = %v, "ignoring SW_APM_TOKEN_BUCKET_CAPACITY outside 0..=8"),
			}
		}
		if let Some(v) = get("TOKEN_BUCKET_RATE") {
			match v.parse::<f64>().ok().filter(|r| (0.0..=4.0).contains(r)) {
				Some(rate) => self.token_bucket_rate = Some(rate),
				None => warn!(value = %v, "ignoring SW_APM_TOKEN_BUCKET_RATE outside 0..=4"),
			}
		}
		if let Some(v) = get("HOSTNAME_ALIAS") {
			self.hostname_alias = Some(v.clone());
		}
		if let Some(v) = get("HISTOGRAM_PRECISION") {
			match v.parse::<u8>().ok().filter(|p| *p <= 5) {
				Some(precision) => self.histogram_precision = precision,
				None => warn!(value = %v, "ignoring SW_APM_HISTOGRAM_PRECISION outside 0..=5"),
			}
		}
		if let Some(v) = get("DEBUG_LEVEL") {
			match DebugLevel::parse(v) {
				Some(level) => self.debug_level = level,
				None => warn!(value = %v, "ignoring unknown SW_APM_DEBUG_LEVEL"),
			}
		}
		if let Some(v) = get("TRIGGER_TRACE") {
			match parse_bool(v) {
				Some(enabled) => self.trigger_trace = enabled,
				None => warn!(value = %v, "ignoring non-boolean SW_APM_TRIGGER_TRACE"),
			}
		}
		if let Some(v) = get("REPORT_QUERY_STRING") {
			match parse_bool(v) {
				Some(enabled) => self.report_query_string = enabled,
				None => warn!(value = %v, "ignoring non-boolean SW_APM_REPORT_QUERY_STRING"),
			}
		}
		if let Some(v) = get("TRANSACTION_NAME") {
			self.transaction_name = Some(v.clone());
		}
	}

	/// The per-process sampling overrides consumed by the decision engine.
	pub fn local_settings(&self) -> LocalSettings {
		LocalSettings {
			tracing_mode: self.tracing_mode,
			sample_rate: self.sample_rate,
			trigger_trace: self.trigger_trace,
			transaction_filters: self.transaction_settings.clone(),
		}
	}

	pub fn service_name(&self) -> &str {
		self
			.service_key
			.as_ref()
			.map(|k| k.service_name.as_str())
			.unwrap_or("")
	}
}

fn read_config_file(path: &str) -> Result<String, Error> {
	let len = std::fs::metadata(path)
		.map(|m| m.len())
		.map_err(|source| Error::ConfigFileUnreadable {
			path: path.to_string(),
			source,
		})?;
	if len > MAX_CONFIG_FILE_BYTES {
		return Err(Error::ConfigFileTooLarge(path.to_string()));
	}
	std::fs::read_to_string(path).map_err(|source| Error::ConfigFileUnreadable {
		path: path.to_string(),
		source,
	})
}

fn parse_bool(raw: &str) -> Option<bool> {
	match raw.to_lowercase().as_str() {
		"true" | "yes" | "1" => Some(true),
		"false" | "no" | "0" => Some(false),
		_ => None,
	}
}

fn parse_tracing_mode(raw: &str) -> Option<TracingMode> {
	match raw.to_lowercase().as_str() {
		"enabled" => Some(TracingMode::Enabled),
		"disabled" => Some(TracingMode::Disabled),
		_ => None,
	}
}

fn validate_sample_rate(rate: i32) -> Option<i32> {
	(0..=crate::oboe::settings::MAX_SAMPLE_RATE)
		.contains(&rate)
		.then_some(rate)
}

/// On-disk YAML shape.
#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "PascalCase", default)]
struct ConfigFile {
	collector: Option<String>,
	service_key: Option<String>,
	trusted_path: Option<String>,
	sampling: Option<SamplingSection>,
	prepend_domain: Option<bool>,
	host_alias: Option<String>,
	precision: Option<u8>,
	report_query_string: Option<bool>,
	trigger_trace: Option<bool>,
	debug_level: Option<String>,
	proxy: Option<String>,
	transaction_settings: Vec<TransactionSettingEntry>,
}

#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "PascalCase", default)]
struct SamplingSection {
	tracing_mode: Option<String>,
	sample_rate: Option<i32>,
}

#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "PascalCase", default)]
struct TransactionSettingEntry {
	#[serde(rename = "Type")]
	entry_type: Option<String>,
	#[serde(rename = "RegEx")]
	regex: Option<String>,
	extensions: Option<Vec<String>>,
	tracing: Option<String>,
}

impl TransactionSettingEntry {
	fn into_filter(self) -> Result<TransactionFilter, &'static str> {
		if self.entry_type.as_deref() != Some("url") {
			return Err("Type must be `url`");
		}
		let mode = self
			.tracing
			.as_deref()
			.and_then(parse_tracing_mode)
			.ok_or("Tracing must be `enabled` or `disabled`")?;
		let matcher = match (self.regex, self.extensions) {
			(Some(_), Some(_)) => return Err("RegEx and Extensions are mutually exclusive"),
			(Some(pattern), None) => UrlMatcher::Regex(
				regex::Regex::new(&pattern).map_err(|_| "RegEx does not compile")?,
			),
			(None, Some(exts)) if !exts.is_empty() => UrlMatcher::Extensions(exts),
			_ => return Err("one of RegEx or Extensions is required"),
		};
		Ok(TransactionFilter { matcher, mode })
	}
}
