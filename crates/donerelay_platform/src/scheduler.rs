#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Shared pool for heartbeat and reconnect timers of every session.
///
/// Created once by the orchestrator; `shutdown` drains it with a bounded wait
/// and cancels whatever is left.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
	tracker: TaskTracker,
	cancel: CancellationToken,
}

impl Scheduler {
	pub fn new() -> Self {
		Self::default()
	}

	/// Run `fut` on the pool. Ignored once shutdown has started.
	pub fn spawn<F>(&self, fut: F)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		if self.tracker.is_closed() {
			debug!("scheduler closed; task dropped");
			return;
		}
		let cancel = self.cancel.clone();
		self.tracker.spawn(async move {
			tokio::select! {
				_ = cancel.cancelled() => {}
				_ = fut => {}
			}
		});
	}

	pub fn is_shut_down(&self) -> bool {
		self.tracker.is_closed()
	}

	pub fn pending(&self) -> usize {
		self.tracker.len()
	}

	/// Returns true when every task finished within `drain`.
	pub async fn shutdown(&self, drain: Duration) -> bool {
		self.tracker.close();
		match tokio::time::timeout(drain, self.tracker.wait()).await {
			Ok(()) => true,
			Err(_) => {
				warn!(pending = self.tracker.len(), ?drain, "scheduler drain timed out; cancelling remaining tasks");
				self.cancel.cancel();
				self.tracker.wait().await;
				false
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[tokio::test]
	async fn drains_finished_tasks() {
		let s = Scheduler::new();
		let hits = Arc::new(AtomicUsize::new(0));
		for _ in 0..3 {
			let hits = hits.clone();
			s.spawn(async move {
				tokio::time::sleep(Duration::from_millis(5)).await;
				hits.fetch_add(1, Ordering::SeqCst);
			});
		}
		assert!(s.shutdown(Duration::from_secs(2)).await);
		assert_eq!(hits.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn cancels_stragglers_after_drain_timeout() {
		let s = Scheduler::new();
		s.spawn(std::future::pending());
		assert!(!s.shutdown(Duration::from_millis(20)).await);
		assert_eq!(s.pending(), 0);
	}

	#[tokio::test]
	async fn spawn_after_shutdown_is_ignored() {
		let s = Scheduler::new();
		assert!(s.shutdown(Duration::from_millis(10)).await);
		let hits = Arc::new(AtomicUsize::new(0));
		let h = hits.clone();
		s.spawn(async move {
			h.fetch_add(1, Ordering::SeqCst);
		});
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(hits.load(Ordering::SeqCst), 0);
		assert!(s.is_shut_down());
	}
}
