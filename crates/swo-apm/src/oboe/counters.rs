use std::sync::atomic::{AtomicU64, Ordering};

/// Which rate-limit population a request belongs to, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
	Regular,
	RelaxedTriggerTrace,
	StrictTriggerTrace,
}

/// What happened to one sampling request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Outcome {
	/// The dice were rolled and chose the request.
	pub sampled: bool,
	/// A token bucket refused the request.
	pub limited: bool,
	/// The final decision was to trace.
	pub traced: bool,
	/// An upstream decision was continued instead of rolling dice.
	pub through: bool,
	/// A trigger-trace request was granted.
	pub triggered: bool,
}

#[derive(Debug, Default)]
struct ClassCounters {
	requested: AtomicU64,
	sampled: AtomicU64,
	limited: AtomicU64,
	traced: AtomicU64,
	through: AtomicU64,
	triggered: AtomicU64,
}

impl ClassCounters {
	fn record(&self, outcome: Outcome) {
		self.requested.fetch_add(1, Ordering::Relaxed);
		for (hit, counter) in [
			(outcome.sampled, &self.sampled),
			(outcome.limited, &self.limited),
			(outcome.traced, &self.traced),
			(outcome.through, &self.through),
			(outcome.triggered, &self.triggered),
		] {
			if hit {
				counter.fetch_add(1, Ordering::Relaxed);
			}
		}
	}

	fn swap(&self) -> ClassSnapshot {
		ClassSnapshot {
			requested: self.requested.swap(0, Ordering::Relaxed),
			sampled: self.sampled.swap(0, Ordering::Relaxed),
			limited: self.limited.swap(0, Ordering::Relaxed),
			traced: self.traced.swap(0, Ordering::Relaxed),
			through: self.through.swap(0, Ordering::Relaxed),
			triggered: self.triggered.swap(0, Ordering::Relaxed),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassSnapshot {
	pub requested: u64,
	pub sampled: u64,
	pub limited: u64,
	pub traced: u64,
	pub through: u64,
	pub triggered: u64,
}

/// Per-decision counters, drained into each metrics message.
#[derive(Debug, Default)]
pub struct RequestCounters {
	regular: ClassCounters,
	relaxed: ClassCounters,
	strict: ClassCounters,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CountersSnapshot {
	pub regular: ClassSnapshot,
	pub relaxed: ClassSnapshot,
	pub strict: ClassSnapshot,
}

impl RequestCounters {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record(&self, class: RequestClass, outcome: Outcome) {
		match class {
			RequestClass::Regular => self.regular.record(outcome),
			RequestClass::RelaxedTriggerTrace => self.relaxed.record(outcome),
			RequestClass::StrictTriggerTrace => self.strict.record(outcome),
		}
	}

	/// Hand the accumulated counts to a metrics flush and start over.
	pub fn swap_and_reset(&self) -> CountersSnapshot {
		CountersSnapshot {
			regular: self.regular.swap(),
			relaxed: self.relaxed.swap(),
			strict: self.strict.swap(),
		}
	}
}
