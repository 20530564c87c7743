use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use opentelemetry::trace::{SpanId, TraceId};
use parking_lot::Mutex;

#[cfg(test)]
#[path = "entryspans_tests.rs"]
mod tests;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
	#[error("span is not an entry span")]
	NotEntrySpan,

	#[error("no entry span recorded for this trace")]
	NotFound,

	#[error("transaction naming is not available in this environment")]
	NotAvailable,
}

/// The parent a span was started under, as seen by the span processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
	None,
	Remote,
	Local,
}

impl Parent {
	/// An entry span is the local root of one inbound request.
	pub fn is_entry(self) -> bool {
		!matches!(self, Parent::Local)
	}
}

/// Per-trace LIFO stacks of entry spans and their pending transaction-name
/// overrides.
///
/// Two implementations exist: the standard in-memory tracker and a no-op
/// variant for environments where finished spans cannot be relabeled. The
/// choice is made once at startup.
pub trait EntrySpans: Send + Sync + Debug {
	fn push(&self, trace_id: TraceId, span_id: SpanId, parent: Parent) -> Result<(), Error>;

	/// Remove `span_id` from its trace's stack; drops the stack when it
	/// becomes empty.
	fn delete(&self, trace_id: TraceId, span_id: SpanId) -> Result<(), Error>;

	/// Topmost not-yet-deleted entry span for the trace.
	fn current(&self, trace_id: TraceId) -> Option<SpanId>;

	fn set_transaction_name(&self, trace_id: TraceId, name: &str) -> Result<(), Error>;

	fn transaction_name(&self, trace_id: TraceId) -> Option<String>;

	/// Drop all state. Test support and shutdown hygiene.
	fn reset(&self);
}

pub fn new_tracker(serverless: bool) -> Arc<dyn EntrySpans> {
	if serverless {
		Arc::new(NoopEntrySpans)
	} else {
		Arc::new(StandardEntrySpans::default())
	}
}

#[derive(Debug)]
struct Entry {
	span_id: SpanId,
	transaction_name: Option<String>,
}

#[derive(Debug, Default)]
pub struct StandardEntrySpans {
	stacks: Mutex<HashMap<TraceId, Vec<Entry>>>,
}

impl EntrySpans for StandardEntrySpans {
	fn push(&self, trace_id: TraceId, span_id: SpanId, parent: Parent) -> Result<(), Error> {
		if !parent.is_entry() {
			return Err(Error::NotEntrySpan);
		}
		self
			.stacks
			.lock()
			.entry(trace_id)
			.or_default()
			.push(Entry {
				span_id,
				transaction_name: None,
			});
		Ok(())
	}

	fn delete(&self, trace_id: TraceId, span_id: SpanId) -> Result<(), Error> {
		let mut stacks = self.stacks.lock();
		let stack = stacks.get_mut(&trace_id).ok_or(Error::NotFound)?;
		let index = stack
			.iter()
			.rposition(|e| e.span_id == span_id)
			.ok_or(Error::NotFound)?;
		stack.remove(index);
		if stack.is_empty() {
			stacks.remove(&trace_id);
		}
		Ok(())
	}

	fn current(&self, trace_id: TraceId) -> Option<SpanId> {
		self
			.stacks
			.lock()
			.get(&trace_id)
			.and_then(|stack| stack.last())
			.map(|e| e.span_id)
	}

	fn set_transaction_name(&self, trace_id: TraceId, name: &str) -> Result<(), Error> {
		let mut stacks = self.stacks.lock();
		let entry = stacks
			.get_mut(&trace_id)
			.and_then(|stack| stack.last_mut())
			.ok_or(Error::NotFound)?;
		entry.transaction_name = Some(name.to_string());
		Ok(())
	}

	fn transaction_name(&self, trace_id: TraceId) -> Option<String> {
		self
			.stacks
			.lock()
			.get(&trace_id)
			.and_then(|stack| stack.last())
			.and_then(|e| e.transaction_name.clone())
	}

	fn reset(&self) {
		self.stacks.lock().clear();
	}
}

/// Used where outgoing spans cannot be modified after the fact; every
/// naming attempt reports `NotAvailable`.
#[derive(Debug)]
struct NoopEntrySpans;

impl EntrySpans for NoopEntrySpans {
	fn push(&self, _trace_id: TraceId, _span_id: SpanId, _parent: Parent) -> Result<(), Error> {
		Ok(())
	}

	fn delete(&self, _trace_id: TraceId, _span_id: SpanId) -> Result<(), Error> {
		Ok(())
	}

	fn current(&self, _trace_id: TraceId) -> Option<SpanId> {
		None
	}

	fn set_transaction_name(&self, _trace_id: TraceId, _name: &str) -> Result<(), Error> {
		Err(Error::NotAvailable)
	}

	fn transaction_name(&self, _trace_id: TraceId) -> Option<String> {
		None
	}

	fn reset(&self) {}
}
