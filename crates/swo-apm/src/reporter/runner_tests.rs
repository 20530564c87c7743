use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use super::*;

#[tokio::test(start_paused = true)]
async fn ticks_on_schedule() {
	let runs = Arc::new(AtomicU32::new(0));
	let (stop_tx, stop_rx) = watch::channel(false);
	let counter = runs.clone();
	spawn_periodic(
		"test",
		stop_rx,
		Duration::ZERO,
		|| Duration::from_secs(10),
		move || {
			let counter = counter.clone();
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
			}
		},
	);

	tokio::time::sleep(Duration::from_secs(1)).await;
	assert_eq!(runs.load(Ordering::SeqCst), 1);

	tokio::time::sleep(Duration::from_secs(30)).await;
	assert_eq!(runs.load(Ordering::SeqCst), 4);
	drop(stop_tx);
}

#[tokio::test(start_paused = true)]
async fn slow_run_skips_overlapping_ticks() {
	let runs = Arc::new(AtomicU32::new(0));
	let (stop_tx, stop_rx) = watch::channel(false);
	let counter = runs.clone();
	spawn_periodic(
		"slow",
		stop_rx,
		Duration::ZERO,
		|| Duration::from_secs(1),
		move || {
			let counter = counter.clone();
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
				// longer than three intervals
				tokio::time::sleep(Duration::from_millis(3500)).await;
			}
		},
	);

	// ticks at 0s,1s,2s,3s,4s: the 1s..3s ticks find the first run still
	// active and are skipped; the 4s tick starts the second run
	tokio::time::sleep(Duration::from_millis(4600)).await;
	assert_eq!(runs.load(Ordering::SeqCst), 2);
	drop(stop_tx);
}

#[tokio::test(start_paused = true)]
async fn stop_signal_halts_the_timer() {
	let runs = Arc::new(AtomicU32::new(0));
	let (stop_tx, stop_rx) = watch::channel(false);
	let counter = runs.clone();
	let handle = spawn_periodic(
		"stoppable",
		stop_rx,
		Duration::ZERO,
		|| Duration::from_secs(1),
		move || {
			let counter = counter.clone();
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
			}
		},
	);

	tokio::time::sleep(Duration::from_millis(1500)).await;
	stop_tx.send(true).unwrap();
	let _ = handle.await;
	let after_stop = runs.load(Ordering::SeqCst);

	tokio::time::sleep(Duration::from_secs(10)).await;
	assert_eq!(runs.load(Ordering::SeqCst), after_stop);
}

#[tokio::test(start_paused = true)]
async fn initial_delay_is_honored() {
	let runs = Arc::new(AtomicU32::new(0));
	let (stop_tx, stop_rx) = watch::channel(false);
	let counter = runs.clone();
	spawn_periodic(
		"delayed",
		stop_rx,
		Duration::from_secs(30),
		|| Duration::from_secs(30),
		move || {
			let counter = counter.clone();
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
			}
		},
	);

	tokio::time::sleep(Duration::from_secs(29)).await;
	assert_eq!(runs.load(Ordering::SeqCst), 0);
	tokio::time::sleep(Duration::from_secs(2)).await;
	assert_eq!(runs.load(Ordering::SeqCst), 1);
	drop(stop_tx);
}
