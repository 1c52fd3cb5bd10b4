#![forbid(unsafe_code)]

//! Host-side collaborators for the standalone binary.

use std::collections::BTreeMap;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use donerelay_domain::{ChannelIdentity, ChatEvent, DonationEvent};
use donerelay_platform::{CommandExecutor, EventSink, PresenceResolver};
use parking_lot::RwLock;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const CONSOLE_QUEUE: usize = 256;

struct ConsoleJob {
	command: String,
	done: oneshot::Sender<bool>,
}

/// Runs every command on one worker, in submission order, by writing it as a line.
#[derive(Clone)]
pub struct ConsoleExecutor {
	tx: mpsc::Sender<ConsoleJob>,
}

impl ConsoleExecutor {
	pub fn stdout() -> Self {
		Self::spawn(tokio::io::stdout())
	}

	pub fn spawn<W>(writer: W) -> Self
	where
		W: AsyncWrite + Unpin + Send + 'static,
	{
		let (tx, rx) = mpsc::channel(CONSOLE_QUEUE);
		tokio::spawn(console_worker(writer, rx));
		Self { tx }
	}
}

async fn console_worker<W>(mut writer: W, mut rx: mpsc::Receiver<ConsoleJob>)
where
	W: AsyncWrite + Unpin + Send + 'static,
{
	while let Some(job) = rx.recv().await {
		let line = format!("{}\n", job.command.trim_end());
		let ok = match writer.write_all(line.as_bytes()).await {
			Ok(()) => writer.flush().await.is_ok(),
			Err(e) => {
				warn!(error = %e, "console write failed");
				false
			}
		};
		let _ = job.done.send(ok);
	}
	debug!("console executor stopped");
}

#[async_trait]
impl CommandExecutor for ConsoleExecutor {
	async fn submit(&self, command: String) -> anyhow::Result<bool> {
		let (done, rx) = oneshot::channel();
		self.tx
			.send(ConsoleJob { command, done })
			.await
			.map_err(|_| anyhow!("console executor stopped"))?;
		rx.await.context("console executor dropped the command")
	}
}

/// Tags currently online, matched case-insensitively.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
	online: RwLock<BTreeMap<String, String>>,
}

impl PresenceRegistry {
	pub fn new(initial: impl IntoIterator<Item = String>) -> Self {
		let registry = Self::default();
		for tag in initial {
			registry.join(&tag);
		}
		registry
	}

	/// Returns false when the tag was already online.
	pub fn join(&self, tag: &str) -> bool {
		self.online
			.write()
			.insert(tag.to_lowercase(), tag.to_string())
			.is_none()
	}

	pub fn leave(&self, tag: &str) -> bool {
		self.online.write().remove(&tag.to_lowercase()).is_some()
	}
}

impl PresenceResolver for PresenceRegistry {
	fn is_known(&self, tag: &str) -> bool {
		self.online.read().contains_key(&tag.to_lowercase())
	}

	fn active_tags(&self) -> Vec<String> {
		self.online.read().values().cloned().collect()
	}
}

/// Logs events; persistence and delivery live elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
	fn on_donation(&self, channel: &ChannelIdentity, event: &DonationEvent) {
		info!(
			platform = %event.platform,
			channel = %channel.nickname,
			tag = %channel.tag,
			donor = %event.donor_name,
			amount = event.amount,
			message = %event.message,
			test = event.is_test,
			"donation"
		);
	}

	fn on_chat(&self, channel: &ChannelIdentity, event: &ChatEvent) {
		debug!(
			platform = %event.platform,
			tag = %channel.tag,
			sender = %event.sender_name,
			role = event.role.as_str(),
			text = %event.text,
			"chat"
		);
	}
}
