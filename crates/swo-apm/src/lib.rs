//! In-process APM agent on top of OpenTelemetry: policy-driven trace
//! sampling with trigger-trace support, W3C `tracestate` interop, inbound
//! request metrics and a batching reporter that ships to the collector.
//!
//! The embedding application calls [`start`] once, instruments with plain
//! OpenTelemetry, and optionally names transactions through
//! [`set_transaction_name`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use once_cell::sync::{Lazy, OnceCell};
use opentelemetry::trace::{SpanId, TraceContextExt, TraceFlags, TraceId};
use opentelemetry::{Context, KeyValue, global};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use parking_lot::RwLock;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::reload;

pub mod config;
pub mod entryspans;
pub mod exporter;
pub mod metrics;
pub mod oboe;
pub mod processor;
pub mod propagator;
pub mod reporter;
pub mod sampler;
pub mod trace;

#[cfg(test)]
mod testutil;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod lib_tests;

use crate::config::{Config, DebugLevel};
use crate::entryspans::EntrySpans;
use crate::metrics::{InboundMetrics, NamingOptions};
use crate::oboe::Oboe;
use crate::processor::ApmSpanProcessor;
use crate::propagator::SwoPropagator;
use crate::reporter::{
	HostInfo, ProcessHostInfo, Reporter, ReporterConfig, ReporterInputs,
};
use crate::sampler::SwoSampler;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
	#[error("transaction name must not be empty")]
	EmptyTransactionName,

	#[error("the agent has not been started")]
	AgentNotStarted,

	#[error("no active trace in the given context")]
	NoActiveTrace,

	#[error(transparent)]
	EntrySpans(#[from] entryspans::Error),
}

struct Globals {
	tracker: Arc<dyn EntrySpans>,
	reporter: Arc<Reporter>,
	service_name: String,
}

static GLOBALS: Lazy<RwLock<Option<Globals>>> = Lazy::new(|| RwLock::new(None));

type FilterHandle = reload::Handle<
	tracing_subscriber::filter::LevelFilter,
	tracing_subscriber::Registry,
>;

static LOG_FILTER: OnceCell<FilterHandle> = OnceCell::new();

/// Handle returned by [`start`]; keeps the tracer provider alive and owns
/// graceful teardown. Dropping it does not stop the agent; call
/// [`Agent::shutdown`].
pub struct Agent {
	provider: Option<SdkTracerProvider>,
	reporter: Option<Arc<Reporter>>,
	shut_down: AtomicBool,
}

impl Agent {
	fn disabled() -> Agent {
		Agent {
			provider: None,
			reporter: None,
			shut_down: AtomicBool::new(false),
		}
	}

	pub fn is_enabled(&self) -> bool {
		self.provider.is_some()
	}

	/// Block until the first settings arrive or `timeout` elapses.
	pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
		match &self.reporter {
			Some(reporter) => reporter.wait_until_ready(timeout).await,
			None => false,
		}
	}

	/// Flush pending telemetry and stop all background work. Idempotent.
	pub async fn shutdown(&self, timeout: Duration) -> Result<(), reporter::Error> {
		if self.shut_down.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		if let Some(provider) = &self.provider {
			let _ = provider.shutdown();
		}
		let result = match &self.reporter {
			Some(reporter) => reporter.shutdown(timeout).await,
			None => Ok(()),
		};
		if let Some(globals) = GLOBALS.write().take() {
			globals.tracker.reset();
		}
		result
	}
}

/// Start the agent: load configuration, connect the reporter, and install
/// the sampler, propagators and span processor into a global tracer
/// provider.
///
/// Configuration problems do not fail the host application; the agent
/// comes up disabled and every API turns into a no-op.
pub async fn start(resource_attrs: Vec<KeyValue>) -> anyhow::Result<Agent> {
	let cfg = match Config::load() {
		Ok(cfg) => cfg,
		Err(err) => {
			warn!(error = %err, "invalid configuration, agent is disabled");
			return Ok(Agent::disabled());
		},
	};
	if !cfg.enabled {
		info!("agent is disabled by configuration");
		return Ok(Agent::disabled());
	}
	let Some(service_key) = cfg.service_key.clone() else {
		warn!("no service key configured, agent is disabled");
		return Ok(Agent::disabled());
	};

	init_diagnostics(cfg.debug_level);

	let settings = Arc::new(oboe::settings::SettingsStore::new());
	let oboe_engine = Arc::new(Oboe::new(settings.clone(), cfg.local_settings()));
	let tracker = entryspans::new_tracker(cfg.transaction_name.is_some());
	let inbound = Arc::new(InboundMetrics::new(cfg.histogram_precision));
	let host: Arc<dyn HostInfo> = Arc::new(ProcessHostInfo);

	let reporter = Reporter::spawn(
		ReporterConfig {
			collector: cfg.collector.clone(),
			service_key: service_key.as_wire(),
			trusted_path: cfg.trusted_path.clone(),
			hostname_alias: cfg.hostname_alias.clone(),
			token_bucket_capacity: cfg.token_bucket_capacity,
			token_bucket_rate: cfg.token_bucket_rate,
			..Default::default()
		},
		ReporterInputs {
			settings: settings.clone(),
			counters: oboe_engine.counters(),
			inbound: inbound.clone(),
			host,
		},
	);

	let naming = NamingOptions {
		default_name: cfg.transaction_name.clone(),
		prepend_domain: cfg.prepend_domain,
	};
	let processor = ApmSpanProcessor::new(
		tracker.clone(),
		inbound,
		settings,
		reporter.clone(),
		naming,
		cfg.report_query_string,
	);

	let mut resource_builder = Resource::builder().with_service_name(service_key.service_name.clone());
	for attr in resource_attrs {
		resource_builder = resource_builder.with_attribute(attr);
	}
	let provider = SdkTracerProvider::builder()
		.with_sampler(SwoSampler::new(oboe_engine))
		.with_span_processor(processor)
		.with_resource(resource_builder.build())
		.build();

	global::set_tracer_provider(provider.clone());
	global::set_text_map_propagator(
		opentelemetry::propagation::TextMapCompositePropagator::new(vec![
			Box::new(TraceContextPropagator::new()),
			Box::new(SwoPropagator::new()),
		]),
	);

	*GLOBALS.write() = Some(Globals {
		tracker,
		reporter: reporter.clone(),
		service_name: service_key.service_name.clone(),
	});
	info!(service = %service_key.service_name, collector = %cfg.collector, "agent started");

	Ok(Agent {
		provider: Some(provider),
		reporter: Some(reporter),
		shut_down: AtomicBool::new(false),
	})
}

/// Override the transaction name the current request aggregates under.
/// The name lands on the most recent entry span of the context's trace.
pub fn set_transaction_name(cx: &Context, name: &str) -> Result<(), Error> {
	let name = name.trim();
	if name.is_empty() {
		return Err(Error::EmptyTransactionName);
	}
	let span = cx.span();
	let sc = span.span_context();
	if !sc.is_valid() {
		return Err(Error::NoActiveTrace);
	}
	let globals = GLOBALS.read();
	let globals = globals.as_ref().ok_or(Error::AgentNotStarted)?;
	globals
		.tracker
		.set_transaction_name(sc.trace_id(), name)
		.map_err(Error::from)
}

/// Retune diagnostic logging at runtime. A no-op when the agent did not
/// install its own subscriber (the host already had one).
pub fn set_log_level(level: DebugLevel) {
	if let Some(handle) = LOG_FILTER.get() {
		let _ = handle.reload(level.as_filter());
	}
}

/// Trace identifiers of the current context in a form ready for log-line
/// injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggableTrace {
	pub trace_id: TraceId,
	pub span_id: SpanId,
	pub trace_flags: TraceFlags,
	pub service_name: String,
}

impl LoggableTrace {
	pub fn is_valid(&self) -> bool {
		self.trace_id != TraceId::INVALID && self.span_id != SpanId::INVALID
	}
}

impl fmt::Display for LoggableTrace {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"trace_id={} span_id={} trace_flags={:02x} resource.service.name={}",
			self.trace_id,
			self.span_id,
			self.trace_flags & TraceFlags::SAMPLED,
			self.service_name
		)
	}
}

/// Identifiers for the active trace in `cx`; all-zero when there is none.
pub fn loggable_trace(cx: &Context) -> LoggableTrace {
	let span = cx.span();
	let sc = span.span_context();
	let service_name = GLOBALS
		.read()
		.as_ref()
		.map(|g| g.service_name.clone())
		.unwrap_or_default();
	LoggableTrace {
		trace_id: sc.trace_id(),
		span_id: sc.span_id(),
		trace_flags: sc.trace_flags(),
		service_name,
	}
}

fn init_diagnostics(level: DebugLevel) {
	let (filter, handle) = reload::Layer::new(level.as_filter());
	let subscriber = tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer());
	if tracing::subscriber::set_global_default(subscriber).is_ok() {
		let _ = LOG_FILTER.set(handle);
	}
}

/// Test support: drop the process-wide agent state.
#[cfg(test)]
fn reset_globals() {
	if let Some(globals) = GLOBALS.write().take() {
		globals.tracker.reset();
	}
}
