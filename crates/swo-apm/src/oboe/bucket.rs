use std::time::Instant;

use parking_lot::Mutex;

#[cfg(test)]
#[path = "bucket_tests.rs"]
mod tests;

/// Floating-point token bucket on the monotonic clock.
///
/// Capacity and rate are fixed at construction; settings replacement swaps
/// in a whole new bucket, so tokens never carry across setting boundaries.
#[derive(Debug)]
pub struct TokenBucket {
	capacity: f64,
	rate: f64,
	inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
	available: f64,
	last_update: Instant,
}

impl TokenBucket {
	/// A new bucket starts full. Negative inputs are clamped to zero; a
	/// zero-capacity bucket refuses every request.
	pub fn new(capacity: f64, rate: f64) -> Self {
		let capacity = capacity.max(0.0);
		TokenBucket {
			capacity,
			rate: rate.max(0.0),
			inner: Mutex::new(Inner {
				available: capacity,
				last_update: Instant::now(),
			}),
		}
	}

	pub fn capacity(&self) -> f64 {
		self.capacity
	}

	pub fn rate(&self) -> f64 {
		self.rate
	}

	/// Refill from elapsed time, then take `cost` tokens or refuse.
	pub fn take(&self, cost: f64) -> bool {
		self.take_at(cost, Instant::now())
	}

	fn take_at(&self, cost: f64, now: Instant) -> bool {
		let mut inner = self.inner.lock();
		let elapsed = now.duration_since(inner.last_update).as_secs_f64();
		inner.available = self
			.capacity
			.min(inner.available + elapsed * self.rate);
		inner.last_update = now;
		if inner.available >= cost {
			inner.available -= cost;
			true
		} else {
			false
		}
	}
}
