#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use donerelay_domain::{ChannelIdentity, Platform, RelaySettings, RelaySnapshot, RewardRules};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::CommandExecutor;
use crate::snapshot::SnapshotHandle;

/// Records every command; commands starting with `hang` never complete and
/// commands starting with `deny` are rejected.
#[derive(Default)]
pub struct RecordingExecutor {
	pub commands: Mutex<Vec<String>>,
	pub notify: Notify,
}

impl RecordingExecutor {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn commands(&self) -> Vec<String> {
		self.commands.lock().clone()
	}

	/// Wait until at least `n` commands were seen.
	pub async fn wait_for(&self, n: usize) -> Vec<String> {
		let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
		loop {
			let notified = self.notify.notified();
			let seen = self.commands();
			if seen.len() >= n {
				return seen;
			}
			if tokio::time::timeout_at(deadline, notified).await.is_err() {
				return self.commands();
			}
		}
	}
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
	async fn submit(&self, command: String) -> anyhow::Result<bool> {
		self.commands.lock().push(command.clone());
		self.notify.notify_waiters();
		if command.starts_with("hang") {
			std::future::pending::<()>().await;
		}
		Ok(!command.starts_with("deny"))
	}
}

pub fn mk_identity(platform: Platform, tag: &str) -> ChannelIdentity {
	ChannelIdentity::new(platform, format!("{tag}-channel"), format!("{tag}-id"), tag).expect("identity")
}

pub fn mk_snapshot(channels: Vec<ChannelIdentity>, rules: &[(u64, &[&str])], random: bool) -> SnapshotHandle {
	let mut rewards = RewardRules::default();
	for (amount, templates) in rules {
		rewards.insert(*amount, templates.iter().map(|t| t.to_string()).collect());
	}
	let settings = RelaySettings {
		random_reward: random,
		..RelaySettings::default()
	};
	SnapshotHandle::new(RelaySnapshot::new(channels, rewards, settings).expect("snapshot"))
}
