#![forbid(unsafe_code)]

use std::sync::Arc;

use donerelay_domain::RelaySnapshot;
use parking_lot::RwLock;

/// Shared handle to the current channel/reward snapshot.
///
/// Readers take an `Arc` per event, so a reload swapping channels and rewards
/// is never observed half-applied.
#[derive(Debug, Clone, Default)]
pub struct SnapshotHandle(Arc<RwLock<Arc<RelaySnapshot>>>);

impl SnapshotHandle {
	pub fn new(snapshot: RelaySnapshot) -> Self {
		Self(Arc::new(RwLock::new(Arc::new(snapshot))))
	}

	pub fn load(&self) -> Arc<RelaySnapshot> {
		Arc::clone(&self.0.read())
	}

	/// Replace the snapshot, returning the previous one.
	pub fn store(&self, snapshot: RelaySnapshot) -> Arc<RelaySnapshot> {
		std::mem::replace(&mut *self.0.write(), Arc::new(snapshot))
	}

	/// Atomically derive the next snapshot from the current one.
	pub fn update(&self, f: impl FnOnce(&RelaySnapshot) -> RelaySnapshot) {
		let mut guard = self.0.write();
		let next = f(&guard);
		*guard = Arc::new(next);
	}
}
