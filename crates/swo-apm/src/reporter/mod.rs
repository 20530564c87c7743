use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use itertools::Itertools;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tracing::{debug, error, info, warn};

use crate::metrics::InboundMetrics;
use crate::oboe::counters::{ClassSnapshot, RequestCounters};
use crate::oboe::settings::SettingsStore;

pub mod collector;
pub mod runner;

use collector::{
	HostId, MessageRequest, ResultCode, SettingsRequest, TraceCollectorClient,
};

#[cfg(test)]
#[path = "reporter_tests.rs"]
mod tests;

pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 10_000;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 6 * 1024 * 1024;
const STATUS_QUEUE_SIZE: usize = 100;

const SETTINGS_INTERVAL: Duration = Duration::from_secs(30);
const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(500);
const RETRY_BACKOFF_FACTOR: f64 = 1.5;
const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
const MAX_RETRIES: u32 = 20;
const RETRY_LOG_THRESHOLD: u32 = 10;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("reporter has shut down")]
	Closed,

	#[error("operation timed out")]
	Timeout,
}

/// One backend event. The key/value document is handed to the wire-format
/// encoder as-is when the batch is flushed.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
	#[serde(rename = "Label")]
	pub label: String,
	#[serde(rename = "Layer", skip_serializing_if = "String::is_empty")]
	pub layer: String,
	#[serde(rename = "Timestamp_u")]
	pub timestamp_micros: u64,
	#[serde(rename = "sw.trace_context", skip_serializing_if = "String::is_empty")]
	pub trace_context: String,
	#[serde(flatten)]
	pub kvs: BTreeMap<String, serde_json::Value>,
}

impl Event {
	pub fn new(label: &str, layer: &str) -> Event {
		Event {
			label: label.to_string(),
			layer: layer.to_string(),
			timestamp_micros: unix_micros(SystemTime::now()),
			trace_context: String::new(),
			kvs: BTreeMap::new(),
		}
	}

	pub fn add(&mut self, key: &str, value: impl Into<serde_json::Value>) -> &mut Event {
		self.kvs.insert(key.to_string(), value.into());
		self
	}

	/// Stand-in for the external wire-format encoder.
	pub fn to_bytes(&self) -> Vec<u8> {
		serde_json::to_vec(self).unwrap_or_default()
	}
}

pub fn unix_micros(t: SystemTime) -> u64 {
	t.duration_since(UNIX_EPOCH)
		.map(|d| d.as_micros().min(u64::MAX as u128) as u64)
		.unwrap_or_default()
}

/// Host facts attached to outgoing messages. Full host-metadata detection
/// lives outside the agent; this is the slice the reporter itself needs.
pub trait HostInfo: Send + Sync + std::fmt::Debug {
	fn hostname(&self) -> String;
	fn pid(&self) -> u32;
	fn cpu_count(&self) -> usize;
}

#[derive(Debug, Default)]
pub struct ProcessHostInfo;

impl HostInfo for ProcessHostInfo {
	fn hostname(&self) -> String {
		std::env::var("HOSTNAME")
			.ok()
			.filter(|h| !h.is_empty())
			.or_else(|| {
				std::fs::read_to_string("/etc/hostname")
					.ok()
					.map(|h| h.trim().to_string())
					.filter(|h| !h.is_empty())
			})
			.unwrap_or_else(|| "unknown".to_string())
	}

	fn pid(&self) -> u32 {
		std::process::id()
	}

	fn cpu_count(&self) -> usize {
		std::thread::available_parallelism()
			.map(|n| n.get())
			.unwrap_or(1)
	}
}

/// Queue and delivery accounting, drained into each metrics message.
#[derive(Debug, Default)]
pub struct ReporterStats {
	sent: AtomicU64,
	overflowed: AtomicU64,
	dropped: AtomicU64,
	queue_depth: AtomicI64,
	queue_largest: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
	pub sent: u64,
	pub overflowed: u64,
	pub dropped: u64,
	pub queue_largest: u64,
}

impl ReporterStats {
	fn enqueued(&self) {
		let depth = self.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
		self
			.queue_largest
			.fetch_max(depth.max(0) as u64, Ordering::Relaxed);
	}

	fn dequeued(&self) {
		self.queue_depth.fetch_sub(1, Ordering::Relaxed);
	}

	fn overflow(&self) {
		self.overflowed.fetch_add(1, Ordering::Relaxed);
	}

	fn sent(&self, count: u64) {
		self.sent.fetch_add(count, Ordering::Relaxed);
	}

	fn dropped(&self, count: u64) {
		self.dropped.fetch_add(count, Ordering::Relaxed);
	}

	pub fn overflowed_total(&self) -> u64 {
		self.overflowed.load(Ordering::Relaxed)
	}

	pub fn sent_total(&self) -> u64 {
		self.sent.load(Ordering::Relaxed)
	}

	/// Per-interval snapshot; resets everything except queue depth.
	fn swap_and_reset(&self) -> StatsSnapshot {
		StatsSnapshot {
			sent: self.sent.swap(0, Ordering::Relaxed),
			overflowed: self.overflowed.swap(0, Ordering::Relaxed),
			dropped: self.dropped.swap(0, Ordering::Relaxed),
			queue_largest: self.queue_largest.swap(0, Ordering::Relaxed),
		}
	}
}

/// Connection to the collector; reconnects lazily after a redirect.
struct Conn {
	target: String,
	trusted_path: Option<PathBuf>,
	client: Option<TraceCollectorClient<Channel>>,
}

impl Conn {
	async fn client(&mut self) -> anyhow::Result<&mut TraceCollectorClient<Channel>> {
		if self.client.is_none() {
			let mut tls = ClientTlsConfig::new().with_native_roots();
			if let Some(path) = &self.trusted_path {
				let pem = tokio::fs::read(path).await?;
				tls = tls.ca_certificate(Certificate::from_pem(pem));
			}
			let channel = Channel::from_shared(format!("https://{}", self.target))?
				.tls_config(tls)?
				.connect_timeout(CONNECT_TIMEOUT)
				.connect()
				.await?;
			self.client = Some(TraceCollectorClient::new(channel));
		}
		self
			.client
			.as_mut()
			.ok_or_else(|| anyhow::anyhow!("collector client unavailable"))
	}

	fn redirect(&mut self, target: String) {
		info!(%target, "collector redirect");
		self.target = target;
		self.client = None;
	}
}

struct Shared {
	conn: tokio::sync::Mutex<Conn>,
	service_key: RwLock<String>,
	identity: HostId,
	stats: ReporterStats,
	terminated: AtomicBool,
	init_sent: AtomicBool,
	ready_tx: watch::Sender<bool>,
	stop_rx: watch::Receiver<bool>,
	settings: Arc<SettingsStore>,
	counters: Arc<RequestCounters>,
	inbound: Arc<InboundMetrics>,
	host: Arc<dyn HostInfo>,
	status_tx: mpsc::Sender<Event>,
	token_bucket_capacity: Option<f64>,
	token_bucket_rate: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ReporterConfig {
	pub collector: String,
	pub service_key: String,
	pub trusted_path: Option<PathBuf>,
	pub hostname_alias: Option<String>,
	pub queue_size: usize,
	pub max_request_bytes: usize,
	pub token_bucket_capacity: Option<f64>,
	pub token_bucket_rate: Option<f64>,
}

impl Default for ReporterConfig {
	fn default() -> Self {
		ReporterConfig {
			collector: crate::config::DEFAULT_COLLECTOR.to_string(),
			service_key: String::new(),
			trusted_path: None,
			hostname_alias: None,
			queue_size: DEFAULT_EVENT_QUEUE_SIZE,
			max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
			token_bucket_capacity: None,
			token_bucket_rate: None,
		}
	}
}

/// Everything the reporter observes but does not own.
pub struct ReporterInputs {
	pub settings: Arc<SettingsStore>,
	pub counters: Arc<RequestCounters>,
	pub inbound: Arc<InboundMetrics>,
	pub host: Arc<dyn HostInfo>,
}

enum Command {
	Flush(oneshot::Sender<()>),
	Shutdown {
		drain: bool,
		done: oneshot::Sender<()>,
	},
}

enum PostOutcome {
	Sent,
	Dropped,
	Terminated,
}

#[derive(Clone, Copy)]
enum Payload {
	Events,
	Metrics,
	Status,
}

impl Payload {
	fn name(self) -> &'static str {
		match self {
			Payload::Events => "events",
			Payload::Metrics => "metrics",
			Payload::Status => "status",
		}
	}
}

/// Receiver ends and sizing for the worker, produced by `build` and
/// consumed by `start`.
pub(crate) struct WorkerChannels {
	pub(crate) events_rx: mpsc::Receiver<Event>,
	status_rx: mpsc::Receiver<Event>,
	commands_rx: mpsc::Receiver<Command>,
	commands_tx: mpsc::Sender<Command>,
	stop_rx: watch::Receiver<bool>,
	max_request_bytes: usize,
}

/// Ships events, status messages and periodic metrics to the collector and
/// keeps the settings store fresh.
pub struct Reporter {
	shared: Arc<Shared>,
	events_tx: mpsc::Sender<Event>,
	commands_tx: mpsc::Sender<Command>,
	ready_rx: watch::Receiver<bool>,
	stop_tx: watch::Sender<bool>,
	shut_down: AtomicBool,
	tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Reporter {
	/// Build the reporter and start its background worker and periodic
	/// tasks. Must be called within a tokio runtime.
	pub fn spawn(config: ReporterConfig, inputs: ReporterInputs) -> Arc<Reporter> {
		let (reporter, channels) = Self::build(config, inputs);
		reporter.start(channels);
		reporter
	}

	pub(crate) fn build(
		config: ReporterConfig,
		inputs: ReporterInputs,
	) -> (Arc<Reporter>, WorkerChannels) {
		let (events_tx, events_rx) = mpsc::channel(config.queue_size.max(1));
		let (status_tx, status_rx) = mpsc::channel(STATUS_QUEUE_SIZE);
		let (commands_tx, commands_rx) = mpsc::channel(8);
		let (ready_tx, ready_rx) = watch::channel(false);
		let (stop_tx, stop_rx) = watch::channel(false);

		let identity = HostId {
			hostname: config
				.hostname_alias
				.clone()
				.unwrap_or_else(|| inputs.host.hostname()),
			pid: inputs.host.pid() as i32,
			host_alias: config.hostname_alias.clone().unwrap_or_default(),
		};
		let shared = Arc::new(Shared {
			conn: tokio::sync::Mutex::new(Conn {
				target: config.collector.clone(),
				trusted_path: config.trusted_path.clone(),
				client: None,
			}),
			service_key: RwLock::new(config.service_key.clone()),
			identity,
			stats: ReporterStats::default(),
			terminated: AtomicBool::new(false),
			init_sent: AtomicBool::new(false),
			ready_tx,
			stop_rx: stop_rx.clone(),
			settings: inputs.settings,
			counters: inputs.counters,
			inbound: inputs.inbound,
			host: inputs.host,
			status_tx,
			token_bucket_capacity: config.token_bucket_capacity,
			token_bucket_rate: config.token_bucket_rate,
		});

		let reporter = Arc::new(Reporter {
			shared,
			events_tx,
			commands_tx: commands_tx.clone(),
			ready_rx,
			stop_tx,
			shut_down: AtomicBool::new(false),
			tasks: parking_lot::Mutex::new(Vec::new()),
		});
		let channels = WorkerChannels {
			events_rx,
			status_rx,
			commands_rx,
			commands_tx,
			stop_rx,
			max_request_bytes: config.max_request_bytes,
		};
		(reporter, channels)
	}

	fn start(&self, channels: WorkerChannels) {
		let shared = self.shared.clone();
		let mut tasks = self.tasks.lock();
		tasks.push(tokio::spawn(run_worker(
			shared.clone(),
			channels.events_rx,
			channels.status_rx,
			channels.commands_rx,
			channels.max_request_bytes,
		)));
		tasks.push(spawn_settings_task(shared.clone(), channels.stop_rx.clone()));
		tasks.push(spawn_expiry_task(shared.clone(), channels.stop_rx.clone()));
		tasks.push(spawn_metrics_task(shared.clone(), channels.stop_rx.clone()));
		tasks.push(spawn_event_flush_task(
			shared,
			channels.commands_tx,
			channels.stop_rx,
		));
	}

	/// Non-blocking enqueue; a full queue drops the event and accounts for
	/// it.
	pub fn report_event(&self, event: Event) {
		if self.shared.terminated.load(Ordering::Relaxed) {
			return;
		}
		match self.events_tx.try_send(event) {
			Ok(()) => self.shared.stats.enqueued(),
			Err(mpsc::error::TrySendError::Full(_)) => self.shared.stats.overflow(),
			Err(mpsc::error::TrySendError::Closed(_)) => {},
		}
	}

	/// Status messages ride a small side channel, also lossy.
	pub fn report_status(&self, event: Event) {
		if self.shared.terminated.load(Ordering::Relaxed) {
			return;
		}
		if self.shared.status_tx.try_send(event).is_err() {
			self.shared.stats.overflow();
		}
	}

	pub fn set_service_key(&self, key: &str) {
		*self.shared.service_key.write() = key.to_string();
	}

	pub fn stats(&self) -> &ReporterStats {
		&self.shared.stats
	}

	/// True once the settings store holds a default setting, or false when
	/// `timeout` elapses first.
	pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
		if *self.ready_rx.borrow() {
			return true;
		}
		let mut rx = self.ready_rx.clone();
		tokio::time::timeout(timeout, async move {
			while rx.changed().await.is_ok() {
				if *rx.borrow() {
					return true;
				}
			}
			false
		})
		.await
		.unwrap_or(false)
	}

	/// Push everything currently queued out to the collector.
	pub async fn flush(&self) -> Result<(), Error> {
		let (done_tx, done_rx) = oneshot::channel();
		self
			.commands_tx
			.send(Command::Flush(done_tx))
			.await
			.map_err(|_| Error::Closed)?;
		done_rx.await.map_err(|_| Error::Closed)
	}

	/// Stop periodic work, drain the queue within `timeout` and close the
	/// connection. Idempotent.
	pub async fn shutdown(&self, timeout: Duration) -> Result<(), Error> {
		if self.shut_down.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		let _ = self.stop_tx.send(true);
		let (done_tx, done_rx) = oneshot::channel();
		if self
			.commands_tx
			.send(Command::Shutdown {
				drain: true,
				done: done_tx,
			})
			.await
			.is_err()
		{
			return Ok(());
		}
		match tokio::time::timeout(timeout, done_rx).await {
			Ok(_) => Ok(()),
			Err(_) => Err(Error::Timeout),
		}
	}

	/// Immediate stop; queued events are abandoned.
	pub fn shutdown_now(&self) {
		if self.shut_down.swap(true, Ordering::SeqCst) {
			return;
		}
		let _ = self.stop_tx.send(true);
		let (done_tx, _done_rx) = oneshot::channel();
		let _ = self.commands_tx.try_send(Command::Shutdown {
			drain: false,
			done: done_tx,
		});
	}
}

fn retry_delay(attempt: u32) -> Duration {
	let factor = RETRY_BACKOFF_FACTOR.powi(attempt.saturating_sub(1) as i32);
	RETRY_MAX_DELAY.min(RETRY_INITIAL_DELAY.mul_f64(factor))
}

/// Submit one batch, retrying transient failures on the bounded-growth
/// backoff schedule. Redirects switch the connection without consuming the
/// retry budget; an invalid service key terminates the reporter for good.
async fn post_with_retry(shared: &Arc<Shared>, payload: Payload, messages: Vec<Vec<u8>>) -> PostOutcome {
	if messages.is_empty() {
		return PostOutcome::Sent;
	}
	let mut attempts: u32 = 0;
	let mut stop_rx = shared.stop_rx.clone();
	loop {
		if shared.terminated.load(Ordering::Relaxed) {
			return PostOutcome::Terminated;
		}
		let request = MessageRequest {
			api_key: shared.service_key.read().clone(),
			messages: messages.clone(),
			identity: Some(shared.identity.clone()),
		};
		let outcome = {
			let mut conn = shared.conn.lock().await;
			match conn.client().await {
				Ok(client) => {
					let result = match payload {
						Payload::Events => client.post_events(request).await,
						Payload::Metrics => client.post_metrics(request).await,
						Payload::Status => client.post_status(request).await,
					};
					match result {
						Ok(response) => {
							let response = response.into_inner();
							match response.code() {
								ResultCode::Ok => Some(PostOutcome::Sent),
								ResultCode::InvalidApiKey => Some(PostOutcome::Terminated),
								ResultCode::Redirect if !response.arg.is_empty() => {
									conn.redirect(response.arg);
									None
								},
								code => {
									debug!(payload = payload.name(), ?code, "collector refused batch");
									Some(PostOutcome::Dropped)
								},
							}
						},
						Err(status) => {
							debug!(payload = payload.name(), %status, "submission failed");
							Some(PostOutcome::Dropped)
						},
					}
				},
				Err(err) => {
					debug!(payload = payload.name(), error = %err, "collector connection failed");
					conn.client = None;
					Some(PostOutcome::Dropped)
				},
			}
		};
		match outcome {
			Some(PostOutcome::Sent) => {
				if attempts > RETRY_LOG_THRESHOLD {
					info!(
						payload = payload.name(),
						attempts, "collector submission recovered"
					);
				}
				return PostOutcome::Sent;
			},
			Some(PostOutcome::Terminated) => {
				error!("collector rejected the service key; reporter is shutting down");
				shared.terminated.store(true, Ordering::Relaxed);
				return PostOutcome::Terminated;
			},
			// redirect: retry immediately, not counted against the budget
			None => continue,
			Some(PostOutcome::Dropped) => {
				attempts += 1;
				if attempts > MAX_RETRIES {
					warn!(
						payload = payload.name(),
						"retries exhausted, dropping batch"
					);
					return PostOutcome::Dropped;
				}
				if attempts > RETRY_LOG_THRESHOLD {
					warn!(
						payload = payload.name(),
						attempts, "collector submission still failing"
					);
				}
				let delay = retry_delay(attempts);
				tokio::select! {
					_ = stop_rx.changed() => return PostOutcome::Dropped,
					_ = tokio::time::sleep(delay) => {},
				}
			},
		}
	}
}

async fn run_worker(
	shared: Arc<Shared>,
	mut events_rx: mpsc::Receiver<Event>,
	mut status_rx: mpsc::Receiver<Event>,
	mut commands_rx: mpsc::Receiver<Command>,
	max_request_bytes: usize,
) {
	let mut pending: Vec<Vec<u8>> = Vec::new();
	let mut pending_bytes = 0usize;

	macro_rules! flush_pending {
		() => {
			if !pending.is_empty() {
				let batch = std::mem::take(&mut pending);
				pending_bytes = 0;
				let count = batch.len() as u64;
				match post_with_retry(&shared, Payload::Events, batch).await {
					PostOutcome::Sent => shared.stats.sent(count),
					PostOutcome::Dropped | PostOutcome::Terminated => shared.stats.dropped(count),
				}
			}
		};
	}

	loop {
		tokio::select! {
			biased;
			command = commands_rx.recv() => match command {
				Some(Command::Flush(done)) => {
					while let Ok(event) = events_rx.try_recv() {
						shared.stats.dequeued();
						let bytes = event.to_bytes();
						pending_bytes += bytes.len();
						pending.push(bytes);
					}
					flush_pending!();
					let _ = done.send(());
				},
				Some(Command::Shutdown { drain, done }) => {
					events_rx.close();
					if drain {
						while let Ok(event) = events_rx.try_recv() {
							shared.stats.dequeued();
							let bytes = event.to_bytes();
							pending_bytes += bytes.len();
							pending.push(bytes);
						}
						flush_pending!();
					}
					let _ = done.send(());
					break;
				},
				None => break,
			},
			status = status_rx.recv() => {
				if let Some(event) = status {
					let outcome =
						post_with_retry(&shared, Payload::Status, vec![event.to_bytes()]).await;
					if matches!(outcome, PostOutcome::Sent) {
						shared.stats.sent(1);
					}
				}
			},
			event = events_rx.recv() => match event {
				Some(event) => {
					shared.stats.dequeued();
					let bytes = event.to_bytes();
					pending_bytes += bytes.len();
					pending.push(bytes);
					if pending_bytes >= max_request_bytes {
						flush_pending!();
					}
				},
				None => {
					flush_pending!();
					break;
				},
			},
		}
	}
	debug!("reporter worker stopped");
}

fn spawn_settings_task(shared: Arc<Shared>, stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
	runner::spawn_periodic(
		"get-settings",
		stop_rx,
		Duration::ZERO,
		|| SETTINGS_INTERVAL,
		move || fetch_settings(shared.clone()),
	)
}

fn spawn_expiry_task(shared: Arc<Shared>, stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
	runner::spawn_periodic(
		"settings-expiry",
		stop_rx,
		EXPIRY_CHECK_INTERVAL,
		|| EXPIRY_CHECK_INTERVAL,
		move || {
			let shared = shared.clone();
			async move {
				shared.settings.expire_timed_out();
				if !shared.settings.has_default() && *shared.ready_tx.borrow() {
					warn!("settings expired without replacement, sampling is paused");
					let _ = shared.ready_tx.send(false);
				}
			}
		},
	)
}

fn spawn_metrics_task(shared: Arc<Shared>, stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
	let interval_shared = shared.clone();
	runner::spawn_periodic(
		"metrics-flush",
		stop_rx,
		metrics_interval(&shared),
		move || metrics_interval(&interval_shared),
		move || flush_metrics(shared.clone()),
	)
}

fn metrics_interval(shared: &Arc<Shared>) -> Duration {
	shared
		.settings
		.get("")
		.map(|s| s.metrics_flush_interval)
		.unwrap_or(crate::oboe::settings::DEFAULT_METRICS_FLUSH_INTERVAL)
}

fn spawn_event_flush_task(
	shared: Arc<Shared>,
	commands_tx: mpsc::Sender<Command>,
	stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
	let interval_shared = shared.clone();
	let interval = move || {
		interval_shared
			.settings
			.get("")
			.map(|s| s.events_flush_interval)
			.unwrap_or(crate::oboe::settings::DEFAULT_EVENTS_FLUSH_INTERVAL)
	};
	runner::spawn_periodic(
		"event-flush",
		stop_rx,
		crate::oboe::settings::DEFAULT_EVENTS_FLUSH_INTERVAL,
		interval,
		move || {
			let commands_tx = commands_tx.clone();
			async move {
				let (done_tx, done_rx) = oneshot::channel();
				if commands_tx.send(Command::Flush(done_tx)).await.is_ok() {
					let _ = done_rx.await;
				}
			}
		},
	)
}

async fn fetch_settings(shared: Arc<Shared>) {
	if shared.terminated.load(Ordering::Relaxed) {
		return;
	}
	let request = SettingsRequest {
		api_key: shared.service_key.read().clone(),
		identity: Some(shared.identity.clone()),
		client_version: env!("CARGO_PKG_VERSION").to_string(),
	};
	let result = {
		let mut conn = shared.conn.lock().await;
		match conn.client().await {
			Ok(client) => match client.get_settings(request).await {
				Ok(response) => {
					let response = response.into_inner();
					match response.code() {
						ResultCode::Ok => Some(response.settings),
						ResultCode::Redirect if !response.arg.is_empty() => {
							conn.redirect(response.arg);
							None
						},
						ResultCode::InvalidApiKey => {
							error!("collector rejected the service key; reporter is shutting down");
							shared.terminated.store(true, Ordering::Relaxed);
							None
						},
						code => {
							debug!(?code, "settings fetch refused");
							None
						},
					}
				},
				Err(status) => {
					debug!(%status, "settings fetch failed");
					None
				},
			},
			Err(err) => {
				debug!(error = %err, "collector connection failed");
				conn.client = None;
				None
			},
		}
	};

	let Some(settings) = result else { return };
	for setting in settings {
		let mut args = setting.to_args();
		// locally configured bucket values cap the delivered ones
		if let Some(capacity) = shared.token_bucket_capacity {
			args.bucket_capacity = args.bucket_capacity.min(capacity);
		}
		if let Some(rate) = shared.token_bucket_rate {
			args.bucket_rate = args.bucket_rate.min(rate);
		}
		shared.settings.update(args.into());
	}
	if shared.settings.has_default() {
		let _ = shared.ready_tx.send(true);
		if !shared.init_sent.swap(true, Ordering::Relaxed) {
			let mut init = Event::new("status", "");
			init.add("__Init", true);
			init.add("APM.Version", env!("CARGO_PKG_VERSION"));
			init.add("Language", "rust");
			let _ = shared.status_tx.try_send(init);
		}
	}
}

async fn flush_metrics(shared: Arc<Shared>) {
	if shared.terminated.load(Ordering::Relaxed) {
		return;
	}
	let message = build_metrics_message(&shared);
	match post_with_retry(&shared, Payload::Metrics, vec![message]).await {
		PostOutcome::Sent => debug!("metrics message sent"),
		PostOutcome::Dropped => debug!("metrics message dropped"),
		PostOutcome::Terminated => {},
	}
}

#[derive(Serialize)]
struct CounterEntry {
	class: &'static str,
	#[serde(flatten)]
	counts: ClassCounts,
}

#[derive(Serialize)]
struct ClassCounts {
	#[serde(rename = "RequestCount")]
	requested: u64,
	#[serde(rename = "SampleCount")]
	sampled: u64,
	#[serde(rename = "TokenBucketExhaustionCount")]
	limited: u64,
	#[serde(rename = "TraceCount")]
	traced: u64,
	#[serde(rename = "ThroughTraceCount")]
	through: u64,
	#[serde(rename = "TriggeredTraceCount")]
	triggered: u64,
}

impl From<ClassSnapshot> for ClassCounts {
	fn from(s: ClassSnapshot) -> ClassCounts {
		ClassCounts {
			requested: s.requested,
			sampled: s.sampled,
			limited: s.limited,
			traced: s.traced,
			through: s.through,
			triggered: s.triggered,
		}
	}
}

#[derive(Serialize)]
struct MeasurementEntry {
	name: &'static str,
	count: u64,
	sum_micros: u64,
	tags: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct MetricsMessage {
	timestamp_micros: u64,
	hostname: String,
	pid: u32,
	cpu_count: usize,
	transaction_name_overflow: bool,
	counters: Vec<CounterEntry>,
	measurements: Vec<MeasurementEntry>,
	histograms: Vec<crate::metrics::HistogramSnapshot>,
	reporter: StatsSnapshot,
}

fn build_metrics_message(shared: &Arc<Shared>) -> Vec<u8> {
	let counts = shared.counters.swap_and_reset();
	let inbound = shared.inbound.flush();
	let measurements = inbound
		.measurements
		.into_iter()
		.sorted_by(|a, b| a.0.transaction.cmp(&b.0.transaction))
		.map(|(key, value)| {
			let mut tags = BTreeMap::new();
			tags.insert("sw.transaction".to_string(), key.transaction);
			tags.insert("sw.is_error".to_string(), key.is_error.to_string());
			if let Some(method) = key.method {
				tags.insert("http.method".to_string(), method);
			}
			if let Some(status) = key.status {
				tags.insert("http.status_code".to_string(), status.to_string());
			}
			MeasurementEntry {
				name: "TransactionResponseTime",
				count: value.count,
				sum_micros: value.sum_micros,
				tags,
			}
		})
		.collect();
	let message = MetricsMessage {
		timestamp_micros: unix_micros(SystemTime::now()),
		hostname: shared.identity.hostname.clone(),
		pid: shared.host.pid(),
		cpu_count: shared.host.cpu_count(),
		transaction_name_overflow: inbound.transaction_name_overflow,
		counters: vec![
			CounterEntry {
				class: "regular",
				counts: counts.regular.into(),
			},
			CounterEntry {
				class: "tt_relaxed",
				counts: counts.relaxed.into(),
			},
			CounterEntry {
				class: "tt_strict",
				counts: counts.strict.into(),
			},
		],
		measurements,
		histograms: inbound.histograms,
		reporter: shared.stats.swap_and_reset(),
	};
	serde_json::to_vec(&message).unwrap_or_default()
}
