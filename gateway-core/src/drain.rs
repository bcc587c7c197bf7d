//! Graceful shutdown signalling, shared by every listener task.
//!
//! A [`DrainWatcher`] is cloned into each in-flight task; [`DrainTrigger::start_drain`]
//! flips a `tokio::sync::watch` channel that every clone observes via
//! [`DrainWatcher::wait_for_drain`]. The trigger's `Drop` impl (via the inner
//! `Arc` refcount) lets callers await full drain by awaiting the last watcher
//! going away.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct DrainWatcher {
	rx: watch::Receiver<bool>,
}

pub struct DrainTrigger {
	tx: Arc<watch::Sender<bool>>,
}

pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (tx, rx) = watch::channel(false);
	(
		DrainTrigger { tx: Arc::new(tx) },
		DrainWatcher { rx },
	)
}

impl DrainTrigger {
	/// Signal every outstanding [`DrainWatcher`] that shutdown has begun.
	pub fn start_drain(&self) {
		// Idempotent: multiple calls just re-send `true`.
		let _ = self.tx.send(true);
	}
}

impl DrainWatcher {
	/// Resolves once [`DrainTrigger::start_drain`] has been called.
	pub async fn wait_for_drain(&self) {
		let mut rx = self.rx.clone();
		if *rx.borrow() {
			return;
		}
		// A closed sender (trigger dropped without draining) also unblocks
		// waiters rather than hanging them forever.
		let _ = rx.changed().await;
	}

	pub fn is_draining(&self) -> bool {
		*self.rx.borrow()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn wait_for_drain_unblocks_after_start_drain() {
		let (trigger, watcher) = new();
		assert!(!watcher.is_draining());

		let w2 = watcher.clone();
		let handle = tokio::spawn(async move {
			w2.wait_for_drain().await;
		});

		tokio::time::sleep(Duration::from_millis(10)).await;
		trigger.start_drain();

		tokio::time::timeout(Duration::from_secs(1), handle)
			.await
			.expect("did not drain in time")
			.unwrap();
		assert!(watcher.is_draining());
	}
}
