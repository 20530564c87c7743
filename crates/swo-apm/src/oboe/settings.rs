use std::collections::HashMap;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::oboe::bucket::TokenBucket;

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;

pub const MAX_SAMPLE_RATE: i32 = 1_000_000;

/// Default per-flush cap on distinct transaction names, used until the
/// collector says otherwise.
pub const DEFAULT_MAX_TRANSACTIONS: usize = 200;
pub const DEFAULT_METRICS_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_EVENTS_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Behavior flags carried by a setting. The collector transmits these as a
/// comma-separated name list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingFlags(u16);

impl SettingFlags {
	pub const INVALID: SettingFlags = SettingFlags(1);
	pub const OVERRIDE: SettingFlags = SettingFlags(1 << 1);
	pub const SAMPLE_START: SettingFlags = SettingFlags(1 << 2);
	pub const SAMPLE_THROUGH: SettingFlags = SettingFlags(1 << 3);
	pub const SAMPLE_THROUGH_ALWAYS: SettingFlags = SettingFlags(1 << 4);
	pub const TRIGGER_TRACE: SettingFlags = SettingFlags(1 << 5);

	pub fn contains(self, other: SettingFlags) -> bool {
		self.0 & other.0 == other.0
	}

	/// Parse the collector's name list. Unknown names are skipped so new
	/// server-side flags do not invalidate the whole setting.
	pub fn parse(names: &str) -> Self {
		let mut flags = SettingFlags::default();
		for name in names.split(',') {
			flags = flags
				| match name.trim() {
					"INVALID" => SettingFlags::INVALID,
					"OVERRIDE" => SettingFlags::OVERRIDE,
					"SAMPLE_START" => SettingFlags::SAMPLE_START,
					"SAMPLE_THROUGH" => SettingFlags::SAMPLE_THROUGH,
					"SAMPLE_THROUGH_ALWAYS" => SettingFlags::SAMPLE_THROUGH_ALWAYS,
					"TRIGGER_TRACE" => SettingFlags::TRIGGER_TRACE,
					_ => SettingFlags::default(),
				};
		}
		flags
	}
}

impl BitOr for SettingFlags {
	type Output = SettingFlags;

	fn bitor(self, rhs: SettingFlags) -> SettingFlags {
		SettingFlags(self.0 | rhs.0)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SettingType {
	Default,
	Layer(String),
}

impl SettingType {
	pub fn layer(&self) -> &str {
		match self {
			SettingType::Default => "",
			SettingType::Layer(layer) => layer,
		}
	}
}

/// One settings record as delivered by the collector. Token buckets live
/// inside the setting and share its lifetime; replacing the setting
/// replaces the buckets wholesale.
#[derive(Debug)]
pub struct Setting {
	pub setting_type: SettingType,
	pub flags: SettingFlags,
	pub sample_rate: i32,
	pub ttl: Duration,
	pub received_at: Instant,
	pub main_bucket: TokenBucket,
	pub tt_relaxed_bucket: TokenBucket,
	pub tt_strict_bucket: TokenBucket,
	pub signature_token: Vec<u8>,
	pub metrics_flush_interval: Duration,
	pub events_flush_interval: Duration,
	pub max_transactions: usize,
}

impl Setting {
	pub fn is_expired(&self, now: Instant) -> bool {
		now > self.received_at + self.ttl
	}

	pub fn is_invalid(&self) -> bool {
		self.flags.contains(SettingFlags::INVALID)
	}

	pub fn token(&self) -> Option<&[u8]> {
		if self.signature_token.is_empty() {
			None
		} else {
			Some(&self.signature_token)
		}
	}
}

#[derive(Default)]
struct Snapshot {
	default: Option<Arc<Setting>>,
	layers: HashMap<String, Arc<Setting>>,
}

/// Process-wide settings table. Readers take an atomic snapshot and never
/// block writers; writers serialize among themselves and publish a new
/// immutable snapshot per change.
pub struct SettingsStore {
	snapshot: ArcSwap<Snapshot>,
	write_lock: Mutex<()>,
}

impl Default for SettingsStore {
	fn default() -> Self {
		SettingsStore {
			snapshot: ArcSwap::from_pointee(Snapshot::default()),
			write_lock: Mutex::new(()),
		}
	}
}

impl SettingsStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Replace the setting with the same `(type, layer)`. The receipt
	/// timestamp is stamped here, not by the caller.
	pub fn update(&self, mut setting: Setting) {
		setting.received_at = Instant::now();
		let setting = Arc::new(setting);
		let _guard = self.write_lock.lock();
		let current = self.snapshot.load();
		let mut next = Snapshot {
			default: current.default.clone(),
			layers: current.layers.clone(),
		};
		match &setting.setting_type {
			SettingType::Default => next.default = Some(setting),
			SettingType::Layer(layer) => {
				next.layers.insert(layer.clone(), setting);
			},
		}
		self.snapshot.store(Arc::new(next));
	}

	/// Active setting for `layer`: the per-layer entry when present and
	/// usable, otherwise the default. Expired or invalid-flagged entries
	/// are treated as absent.
	pub fn get(&self, layer: &str) -> Option<Arc<Setting>> {
		self.get_at(layer, Instant::now())
	}

	fn get_at(&self, layer: &str, now: Instant) -> Option<Arc<Setting>> {
		let snapshot = self.snapshot.load();
		if !layer.is_empty()
			&& let Some(setting) = snapshot.layers.get(layer)
			&& !setting.is_invalid()
			&& !setting.is_expired(now)
		{
			return Some(setting.clone());
		}
		snapshot
			.default
			.as_ref()
			.filter(|s| !s.is_invalid() && !s.is_expired(now))
			.cloned()
	}

	/// Drop every setting whose TTL has elapsed.
	pub fn expire_timed_out(&self) {
		self.expire_at(Instant::now());
	}

	fn expire_at(&self, now: Instant) {
		let _guard = self.write_lock.lock();
		let current = self.snapshot.load();
		let expired_default = current
			.default
			.as_ref()
			.is_some_and(|s| s.is_expired(now));
		let any_expired_layer = current.layers.values().any(|s| s.is_expired(now));
		if !expired_default && !any_expired_layer {
			return;
		}
		let next = Snapshot {
			default: current.default.clone().filter(|s| !s.is_expired(now)),
			layers: current
				.layers
				.iter()
				.filter(|(_, s)| !s.is_expired(now))
				.map(|(k, s)| (k.clone(), s.clone()))
				.collect(),
		};
		self.snapshot.store(Arc::new(next));
	}

	pub fn has_default(&self) -> bool {
		self
			.snapshot
			.load()
			.default
			.as_ref()
			.is_some_and(|s| !s.is_expired(Instant::now()))
	}

	pub fn reset(&self) {
		let _guard = self.write_lock.lock();
		self.snapshot.store(Arc::new(Snapshot::default()));
	}
}

/// Plain-value form of a setting, produced by the collector response
/// decoder and by tests.
#[derive(Debug, Clone)]
pub struct SettingArgs {
	pub setting_type: SettingType,
	pub flags: SettingFlags,
	pub sample_rate: i32,
	pub ttl: Duration,
	pub bucket_capacity: f64,
	pub bucket_rate: f64,
	pub tt_relaxed_capacity: f64,
	pub tt_relaxed_rate: f64,
	pub tt_strict_capacity: f64,
	pub tt_strict_rate: f64,
	pub signature_token: Vec<u8>,
	pub metrics_flush_interval: Duration,
	pub events_flush_interval: Duration,
	pub max_transactions: usize,
}

impl Default for SettingArgs {
	fn default() -> Self {
		SettingArgs {
			setting_type: SettingType::Default,
			flags: SettingFlags::default(),
			sample_rate: 0,
			ttl: Duration::from_secs(120),
			bucket_capacity: 0.0,
			bucket_rate: 0.0,
			tt_relaxed_capacity: 0.0,
			tt_relaxed_rate: 0.0,
			tt_strict_capacity: 0.0,
			tt_strict_rate: 0.0,
			signature_token: Vec::new(),
			metrics_flush_interval: DEFAULT_METRICS_FLUSH_INTERVAL,
			events_flush_interval: DEFAULT_EVENTS_FLUSH_INTERVAL,
			max_transactions: DEFAULT_MAX_TRANSACTIONS,
		}
	}
}

impl From<SettingArgs> for Setting {
	fn from(args: SettingArgs) -> Setting {
		Setting {
			setting_type: args.setting_type,
			flags: args.flags,
			sample_rate: args.sample_rate.clamp(0, MAX_SAMPLE_RATE),
			ttl: args.ttl,
			received_at: Instant::now(),
			main_bucket: TokenBucket::new(args.bucket_capacity, args.bucket_rate),
			tt_relaxed_bucket: TokenBucket::new(args.tt_relaxed_capacity, args.tt_relaxed_rate),
			tt_strict_bucket: TokenBucket::new(args.tt_strict_capacity, args.tt_strict_rate),
			signature_token: args.signature_token,
			metrics_flush_interval: args.metrics_flush_interval,
			events_flush_interval: args.events_flush_interval,
			max_transactions: args.max_transactions,
		}
	}
}
