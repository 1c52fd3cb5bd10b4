#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use donerelay_domain::{ChannelIdentity, Platform};
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::CommandExecutor;
use crate::error::CommandError;
use crate::snapshot::SnapshotHandle;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Substitute `%token%` placeholders in one pass.
///
/// Substituted values are not scanned again, so a donor named `%amount%` stays
/// literal. Unknown `%...%` sequences are left untouched.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
	let mut out = String::with_capacity(template.len());
	let mut rest = template;

	while let Some(start) = rest.find('%') {
		out.push_str(&rest[..start]);
		let tail = &rest[start..];
		match values.iter().find(|(token, _)| tail.starts_with(token)) {
			Some((token, value)) => {
				out.push_str(value);
				rest = &tail[token.len()..];
			}
			None => {
				out.push('%');
				rest = &tail[1..];
			}
		}
	}
	out.push_str(rest);
	out
}

/// In-flight command submissions that shutdown can abort.
#[derive(Debug, Default)]
pub struct PendingCommands {
	inner: Mutex<PendingInner>,
}

#[derive(Debug, Default)]
struct PendingInner {
	next_id: u64,
	handles: HashMap<u64, AbortHandle>,
	closed: bool,
}

impl PendingCommands {
	fn register(&self, handle: AbortHandle) -> Option<u64> {
		let mut inner = self.inner.lock();
		if inner.closed {
			handle.abort();
			return None;
		}
		inner.next_id += 1;
		let id = inner.next_id;
		inner.handles.insert(id, handle);
		Some(id)
	}

	fn release(&self, id: u64) {
		self.inner.lock().handles.remove(&id);
	}

	/// Abort everything in flight and refuse new submissions. Returns how many were aborted.
	pub fn cancel_all(&self) -> usize {
		let mut inner = self.inner.lock();
		inner.closed = true;
		let handles: Vec<_> = inner.handles.drain().map(|(_, h)| h).collect();
		drop(inner);
		for h in &handles {
			h.abort();
		}
		handles.len()
	}

	pub fn is_closed(&self) -> bool {
		self.inner.lock().closed
	}

	pub fn len(&self) -> usize {
		self.inner.lock().handles.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Outcome of one donation's reward run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
	pub rule_found: bool,
	pub submitted: usize,
	pub succeeded: usize,
	pub failures: Vec<CommandError>,
}

/// Donation amount -> reward commands -> host executor.
pub struct RewardDispatcher {
	platform: Platform,
	snapshot: SnapshotHandle,
	executor: Arc<dyn CommandExecutor>,
	command_timeout: Duration,
	pending: PendingCommands,
}

impl RewardDispatcher {
	pub fn new(
		platform: Platform,
		snapshot: SnapshotHandle,
		executor: Arc<dyn CommandExecutor>,
		command_timeout: Duration,
	) -> Self {
		Self {
			platform,
			snapshot,
			executor,
			command_timeout,
			pending: PendingCommands::default(),
		}
	}

	pub fn pending(&self) -> &PendingCommands {
		&self.pending
	}

	/// Abort outstanding submissions; later dispatches submit nothing.
	pub fn cancel_pending(&self) -> usize {
		self.pending.cancel_all()
	}

	/// Run the reward rule for `amount`. Each command completes or times out
	/// before the next one is submitted; failures do not stop the rest.
	pub async fn dispatch(
		&self,
		identity: &ChannelIdentity,
		donor_name: &str,
		amount: u64,
		message: &str,
	) -> DispatchReport {
		let mut report = DispatchReport::default();
		let snapshot = self.snapshot.load();

		let Some(templates) = snapshot.rewards().lookup(amount) else {
			debug!(platform = %self.platform, channel = %identity.nickname, amount, "no reward rule for amount");
			return report;
		};
		report.rule_found = true;

		let selected: Vec<&String> = if snapshot.settings().random_reward {
			let idx = rand::rng().random_range(0..templates.len());
			vec![&templates[idx]]
		} else {
			templates.iter().collect()
		};

		let amount_text = amount.to_string();
		let values = [
			("%tag%", identity.tag.as_str()),
			("%name%", donor_name),
			("%amount%", amount_text.as_str()),
			("%message%", message),
		];

		for template in selected {
			for part in template.split(';').map(str::trim).filter(|p| !p.is_empty()) {
				if self.pending.is_closed() {
					debug!(platform = %self.platform, channel = %identity.nickname, "dispatcher cancelled; skipping remaining rewards");
					return report;
				}

				let command = render_template(part, &values);
				report.submitted += 1;
				match self.submit(command).await {
					Ok(()) => report.succeeded += 1,
					Err(e) => {
						warn!(platform = %self.platform, channel = %identity.nickname, error = %e, "reward command failed");
						report.failures.push(e);
					}
				}
			}
		}

		info!(
			platform = %self.platform,
			channel = %identity.nickname,
			donor = %donor_name,
			amount,
			submitted = report.submitted,
			succeeded = report.succeeded,
			"reward dispatched"
		);
		report
	}

	async fn submit(&self, command: String) -> Result<(), CommandError> {
		let executor = Arc::clone(&self.executor);
		let unit = command.clone();
		let task = tokio::spawn(async move { executor.submit(unit).await });
		let Some(id) = self.pending.register(task.abort_handle()) else {
			return Err(CommandError::Cancelled);
		};

		metrics::counter!("donerelay_commands_submitted_total", "platform" => self.platform.as_str()).increment(1);
		let res = tokio::time::timeout(self.command_timeout, task).await;
		self.pending.release(id);

		let outcome = match res {
			Ok(Ok(Ok(true))) => Ok(()),
			Ok(Ok(Ok(false))) => Err(CommandError::Rejected(command)),
			Ok(Ok(Err(e))) => Err(CommandError::Failed(format!("{command}: {e:#}"))),
			Ok(Err(join)) if join.is_cancelled() => Err(CommandError::Cancelled),
			Ok(Err(join)) => Err(CommandError::Failed(format!("{command}: {join}"))),
			Err(_) => {
				metrics::counter!("donerelay_command_timeouts_total", "platform" => self.platform.as_str()).increment(1);
				return Err(CommandError::Timeout {
					timeout: self.command_timeout,
					command,
				});
			}
		};
		if outcome.is_err() {
			metrics::counter!("donerelay_command_failures_total", "platform" => self.platform.as_str()).increment(1);
		}
		outcome
	}
}

#[cfg(test)]
#[path = "reward_tests.rs"]
mod tests;
