use assert_matches::assert_matches;
use opentelemetry::trace::{SpanContext, TraceContextExt, TraceState};
use parking_lot::Mutex;

use super::*;
use crate::oboe::counters::RequestCounters;
use crate::oboe::settings::SettingsStore;

// the agent globals are process-wide; serialize the tests that touch them
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn remote_context(trace: u128, span: u64) -> Context {
	Context::new().with_remote_span_context(SpanContext::new(
		TraceId::from(trace),
		SpanId::from(span),
		TraceFlags::SAMPLED,
		true,
		TraceState::default(),
	))
}

fn install_globals() -> (Arc<dyn EntrySpans>, crate::reporter::WorkerChannels) {
	let tracker = entryspans::new_tracker(false);
	let (reporter, channels) = Reporter::build(
		ReporterConfig {
			collector: "127.0.0.1:9".to_string(),
			service_key: "token:my-service".to_string(),
			..Default::default()
		},
		ReporterInputs {
			settings: Arc::new(SettingsStore::new()),
			counters: Arc::new(RequestCounters::new()),
			inbound: Arc::new(InboundMetrics::new(2)),
			host: Arc::new(ProcessHostInfo),
		},
	);
	*GLOBALS.write() = Some(Globals {
		tracker: tracker.clone(),
		reporter,
		service_name: "my-service".to_string(),
	});
	(tracker, channels)
}

#[test]
fn set_transaction_name_requires_started_agent() {
	let _guard = TEST_LOCK.lock();
	reset_globals();
	assert_matches!(
		set_transaction_name(&remote_context(1, 2), "checkout"),
		Err(Error::AgentNotStarted)
	);
}

#[test]
fn set_transaction_name_rejects_blank_names() {
	let _guard = TEST_LOCK.lock();
	assert_matches!(
		set_transaction_name(&remote_context(1, 2), ""),
		Err(Error::EmptyTransactionName)
	);
	assert_matches!(
		set_transaction_name(&remote_context(1, 2), "   "),
		Err(Error::EmptyTransactionName)
	);
}

#[test]
fn set_transaction_name_requires_an_active_trace() {
	let _guard = TEST_LOCK.lock();
	assert_matches!(
		set_transaction_name(&Context::new(), "checkout"),
		Err(Error::NoActiveTrace)
	);
}

#[test]
fn set_transaction_name_reaches_the_tracker() {
	let _guard = TEST_LOCK.lock();
	let (tracker, _channels) = install_globals();
	let trace_id = TraceId::from(42);
	tracker
		.push(trace_id, SpanId::from(7), entryspans::Parent::Remote)
		.unwrap();

	set_transaction_name(&remote_context(42, 7), "  checkout  ").unwrap();
	assert_eq!(tracker.transaction_name(trace_id).as_deref(), Some("checkout"));

	// a trace the tracker has never seen reports the tracker error
	assert_matches!(
		set_transaction_name(&remote_context(999, 1), "nope"),
		Err(Error::EntrySpans(entryspans::Error::NotFound))
	);
	reset_globals();
}

#[test]
fn loggable_trace_renders_for_log_injection() {
	let _guard = TEST_LOCK.lock();
	let (_tracker, _channels) = install_globals();
	let cx = remote_context(0x0af7_6519_16cd_43dd_8448_eb21_1c80_319c, 0x00f0_67aa_0ba9_02b7);
	let loggable = loggable_trace(&cx);
	assert!(loggable.is_valid());
	assert_eq!(
		loggable.to_string(),
		"trace_id=0af7651916cd43dd8448eb211c80319c span_id=00f067aa0ba902b7 trace_flags=01 resource.service.name=my-service"
	);
	reset_globals();
}

#[test]
fn loggable_trace_without_context_is_invalid() {
	let _guard = TEST_LOCK.lock();
	reset_globals();
	let loggable = loggable_trace(&Context::new());
	assert!(!loggable.is_valid());
	assert_eq!(loggable.trace_id, TraceId::INVALID);
	assert_eq!(loggable.service_name, "");
}

#[tokio::test]
async fn disabled_agent_is_a_no_op() {
	let agent = Agent::disabled();
	assert!(!agent.is_enabled());
	assert!(!agent.wait_until_ready(Duration::from_millis(10)).await);
	agent.shutdown(Duration::from_secs(1)).await.unwrap();
	agent.shutdown(Duration::from_secs(1)).await.unwrap();
}
