use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::trace;

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;

/// Run `body` forever on a timer, one instance at a time.
///
/// Each tick first checks the task's done channel: if the previous run has
/// not signalled completion yet the tick is skipped, so a slow run never
/// stacks up behind itself. Other tasks run on their own timers and are
/// unaffected. The first run fires after `initial`; subsequent ticks are
/// spaced by `interval()`, re-evaluated every round so settings-driven
/// cadences can change at runtime.
pub fn spawn_periodic<F, Fut>(
	name: &'static str,
	mut stop: watch::Receiver<bool>,
	initial: Duration,
	interval: impl Fn() -> Duration + Send + 'static,
	body: F,
) -> JoinHandle<()>
where
	F: Fn() -> Fut + Send + 'static,
	Fut: Future<Output = ()> + Send + 'static,
{
	tokio::spawn(async move {
		let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
		let mut in_flight = false;
		let mut next = tokio::time::Instant::now() + initial;
		loop {
			tokio::select! {
				_ = stop.changed() => break,
				_ = tokio::time::sleep_until(next) => {
					next = tokio::time::Instant::now() + interval();
					if in_flight {
						match done_rx.try_recv() {
							Ok(()) => in_flight = false,
							Err(_) => {
								trace!(task = name, "previous run still in flight, skipping tick");
								continue;
							},
						}
					}
					in_flight = true;
					let done = done_tx.clone();
					let fut = body();
					tokio::spawn(async move {
						fut.await;
						let _ = done.send(()).await;
					});
				},
			}
		}
		trace!(task = name, "periodic task stopped");
	})
}
