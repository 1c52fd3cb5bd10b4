#![forbid(unsafe_code)]

//! Owns both platform pools, the shared scheduler and the current snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use donerelay_domain::{ChannelIdentity, ConfigLoadError, DonationEvent, Platform, RelaySettings, RelaySnapshot};
use donerelay_platform::{
	CommandExecutor, DispatchReport, DriverFactory, EventSink, FeatureGate, PresenceResolver, RewardDispatcher, Scheduler,
	SessionContext, SessionError, SessionSettings, SnapshotHandle,
};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::{ChannelConfigProvider, ConnectionSettings};
use crate::server::pool::{ConnectOutcome, FlagGuard, PoolSettings, SessionPool, SessionStatus};

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
	pub pool: PoolSettings,
	pub reload_settle: Duration,
	pub reload_timeout: Duration,
	pub scheduler_drain: Duration,
	/// Pause between dropping and reopening channels in a targeted reconnect.
	pub reconnect_pause: Duration,
	pub command_timeout: Duration,
}

impl Default for OrchestratorSettings {
	fn default() -> Self {
		Self::from(&ConnectionSettings::default())
	}
}

impl From<&ConnectionSettings> for OrchestratorSettings {
	fn from(c: &ConnectionSettings) -> Self {
		Self {
			pool: PoolSettings {
				settle_delay: c.settle_delay,
				disconnect_timeout: c.disconnect_timeout,
			},
			reload_settle: c.reload_settle,
			reload_timeout: c.reload_timeout,
			scheduler_drain: c.scheduler_drain,
			reconnect_pause: Duration::from_secs(1),
			command_timeout: c.session.command_timeout,
		}
	}
}

/// Host-side collaborators handed to the orchestrator.
pub struct Collaborators {
	pub executor: Arc<dyn CommandExecutor>,
	pub sink: Arc<dyn EventSink>,
	pub presence: Arc<dyn PresenceResolver>,
	pub gate: Arc<dyn FeatureGate>,
	pub drivers: Arc<dyn DriverFactory>,
	pub provider: Arc<dyn ChannelConfigProvider>,
}

#[derive(Debug, Error)]
pub enum ReloadError {
	#[error("a reload is already in progress")]
	InProgress,
	#[error(transparent)]
	Config(#[from] ConfigLoadError),
}

/// Aggregate connect result across both platforms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadReport {
	pub connected: usize,
	pub total: usize,
}

impl ReloadReport {
	fn add(mut self, outcome: ConnectOutcome) -> Self {
		self.connected += outcome.connected();
		self.total += outcome.total();
		self
	}
}

/// A configured (or ad-hoc) channel and its live session, if any.
#[derive(Debug, Clone)]
pub struct ChannelStatus {
	pub identity: ChannelIdentity,
	pub session: Option<SessionStatus>,
}

pub struct Orchestrator {
	chzzk: SessionPool,
	soop: SessionPool,
	snapshot: SnapshotHandle,
	provider: Arc<dyn ChannelConfigProvider>,
	presence: Arc<dyn PresenceResolver>,
	executor: Arc<dyn CommandExecutor>,
	sink: Arc<dyn EventSink>,
	/// Shared with every session; suppresses their self-reconnect.
	reloading: Arc<AtomicBool>,
	/// Held for a whole reload; a second reload is rejected.
	reload_running: AtomicBool,
	scheduler: Scheduler,
	settings: OrchestratorSettings,
}

impl Orchestrator {
	pub fn new(collab: Collaborators, session: SessionSettings, settings: OrchestratorSettings) -> Self {
		let snapshot = SnapshotHandle::default();
		let scheduler = Scheduler::new();
		let reloading = Arc::new(AtomicBool::new(false));

		let ctx = Arc::new(SessionContext {
			scheduler: scheduler.clone(),
			executor: Arc::clone(&collab.executor),
			sink: Arc::clone(&collab.sink),
			presence: Arc::clone(&collab.presence),
			snapshot: snapshot.clone(),
			reloading: Arc::clone(&reloading),
			settings: session,
		});
		let pool = |platform| {
			SessionPool::new(
				platform,
				Arc::clone(&ctx),
				Arc::clone(&collab.drivers),
				Arc::clone(&collab.gate),
				settings.pool,
			)
		};

		Self {
			chzzk: pool(Platform::Chzzk),
			soop: pool(Platform::Soop),
			snapshot,
			provider: collab.provider,
			presence: collab.presence,
			executor: collab.executor,
			sink: collab.sink,
			reloading,
			reload_running: AtomicBool::new(false),
			scheduler,
			settings,
		}
	}

	pub fn pool(&self, platform: Platform) -> &SessionPool {
		match platform {
			Platform::Chzzk => &self.chzzk,
			Platform::Soop => &self.soop,
		}
	}

	pub fn snapshot(&self) -> Arc<RelaySnapshot> {
		self.snapshot.load()
	}

	pub fn is_reloading(&self) -> bool {
		self.reload_running.load(Ordering::Acquire)
	}

	/// Load the configuration and open the initial connections.
	///
	/// A load error here is fatal to the caller.
	pub async fn start(&self) -> Result<ReloadReport, ConfigLoadError> {
		let snapshot = self.provider.load()?;
		let settings = snapshot.settings();
		info!(
			channels = snapshot.channels().len(),
			rewards = snapshot.rewards().len(),
			auto_connect = settings.auto_connect,
			"configuration loaded"
		);
		self.snapshot.store(snapshot);
		Ok(self.connect_initial(settings).await)
	}

	/// Every channel when `auto_connect` is on, otherwise only channels of active tags.
	async fn connect_initial(&self, settings: RelaySettings) -> ReloadReport {
		if settings.auto_connect {
			let (a, b) = tokio::join!(self.chzzk.connect_configured(), self.soop.connect_configured());
			return ReloadReport::default().add(a).add(b);
		}

		let mut report = ReloadReport::default();
		for tag in self.presence.active_tags() {
			let (a, b) = tokio::join!(self.chzzk.connect_for_tag(&tag), self.soop.connect_for_tag(&tag));
			report = report.add(a).add(b);
		}
		report
	}

	/// Drain and reconnect every configured channel on both platforms.
	pub async fn connect_everything(&self) -> ReloadReport {
		let (a, b) = tokio::join!(self.chzzk.connect_all(), self.soop.connect_all());
		let report = ReloadReport::default().add(a).add(b);
		info!(connected = report.connected, total = report.total, "connect-all finished");
		report
	}

	pub async fn disconnect_everything(&self) -> usize {
		let (a, b) = tokio::join!(self.chzzk.disconnect_all(), self.soop.disconnect_all());
		a + b
	}

	/// Drain both pools, swap in a freshly loaded snapshot and reconnect.
	///
	/// The new configuration is loaded before anything is touched; on failure the
	/// running sessions and the current snapshot stay as they are.
	pub async fn reload(&self) -> Result<ReloadReport, ReloadError> {
		let Some(_running) = FlagGuard::try_acquire(&self.reload_running) else {
			warn!("reload requested while another reload is running; ignored");
			return Err(ReloadError::InProgress);
		};

		let next = match self.provider.load() {
			Ok(next) => next,
			Err(e) => {
				metrics::counter!("donerelay_reload_failures_total").increment(1);
				error!(error = %e, "reload aborted; keeping current configuration");
				return Err(e.into());
			}
		};
		let settings = next.settings();
		let limit = self.settings.reload_timeout;

		{
			let _suppress = FlagGuard::raise(&self.reloading);
			info!("reload: draining sessions");
			if timeout(limit, self.disconnect_everything()).await.is_err() {
				warn!(?limit, "reload: drain did not finish in time; continuing");
			}
			sleep(self.settings.reload_settle).await;
			self.snapshot.store(next);
		}

		let report = match timeout(limit, self.connect_initial(settings)).await {
			Ok(report) => report,
			Err(_) => {
				warn!(?limit, "reload: reconnect did not finish in time; reporting current state");
				ReloadReport {
					connected: self.chzzk.connected_count() + self.soop.connected_count(),
					total: self.snapshot.load().channels().len(),
				}
			}
		};

		metrics::counter!("donerelay_reloads_total").increment(1);
		info!(connected = report.connected, total = report.total, "reload finished");
		Ok(report)
	}

	/// `all` restarts both pools. Anything else drops the sessions whose nickname
	/// or tag matches, pauses, and reconnects the matching channels.
	pub async fn reconnect(&self, target: &str) -> ReloadReport {
		if target.eq_ignore_ascii_case("all") {
			return self.connect_everything().await;
		}

		let (a, b) = tokio::join!(self.chzzk.disconnect_target(target), self.soop.disconnect_target(target));
		debug!(%target, dropped = a + b, "reconnect: sessions dropped");
		sleep(self.settings.reconnect_pause).await;

		let snapshot = self.snapshot.load();
		let (a, b) = tokio::join!(
			self.chzzk.connect_identities(snapshot.find(Platform::Chzzk, target)),
			self.soop.connect_identities(snapshot.find(Platform::Soop, target)),
		);
		let report = ReloadReport::default().add(a).add(b);
		if report.total == 0 {
			warn!(%target, "reconnect: no channel matches");
		}
		report
	}

	/// Connect a channel that is not in the configuration file. A duplicate is a no-op.
	pub async fn add_channel(&self, identity: ChannelIdentity) -> Result<(), SessionError> {
		self.pool(identity.platform).connect_one(identity.clone()).await?;
		info!(platform = %identity.platform, channel = %identity.nickname, tag = %identity.tag, "channel added");
		self.snapshot.update(|s| s.with_channel(identity));
		Ok(())
	}

	/// Connect-if-absent for the channels of a tag that just became active.
	pub async fn on_presence_joined(&self, tag: &str) -> ReloadReport {
		if self.is_reloading() {
			debug!(%tag, "presence join ignored during reload");
			return ReloadReport::default();
		}

		let (a, b) = tokio::join!(self.chzzk.connect_for_tag(tag), self.soop.connect_for_tag(tag));
		ReloadReport::default().add(a).add(b)
	}

	/// Drop the sessions of a tag that went away.
	pub async fn on_presence_left(&self, tag: &str) -> usize {
		if self.is_reloading() {
			debug!(%tag, "presence leave ignored during reload");
			return 0;
		}
		let (a, b) = tokio::join!(self.chzzk.disconnect_target(tag), self.soop.disconnect_target(tag));
		a + b
	}

	/// Run a fake donation through the sink and reward rules of a configured channel.
	pub async fn test_donation(
		&self,
		platform: Platform,
		target: &str,
		amount: u64,
		donor: &str,
		message: &str,
	) -> Option<DispatchReport> {
		let Some(identity) = self.snapshot.load().find(platform, target).into_iter().next() else {
			warn!(%platform, %target, "test donation: no such channel");
			return None;
		};

		let ev = DonationEvent::test(platform, donor, amount, message);
		self.sink.on_donation(&identity, &ev);

		let dispatcher = RewardDispatcher::new(
			platform,
			self.snapshot.clone(),
			Arc::clone(&self.executor),
			self.settings.command_timeout,
		);
		Some(dispatcher.dispatch(&identity, &ev.donor_name, ev.amount, &ev.message).await)
	}

	/// Every known channel with its session, configured ones first.
	pub fn status(&self) -> Vec<ChannelStatus> {
		let snapshot = self.snapshot.load();
		let mut sessions = self.chzzk.status();
		sessions.extend(self.soop.status());

		let mut rows: Vec<ChannelStatus> = snapshot
			.channels()
			.iter()
			.map(|c| {
				let session = sessions
					.iter()
					.position(|s| s.identity.same_channel(c))
					.map(|i| sessions.swap_remove(i));
				ChannelStatus {
					identity: c.clone(),
					session,
				}
			})
			.collect();
		rows.extend(sessions.into_iter().map(|s| ChannelStatus {
			identity: s.identity.clone(),
			session: Some(s),
		}));
		rows
	}

	/// Close every session, then drain the shared scheduler.
	pub async fn shutdown(&self) {
		let _suppress = FlagGuard::raise(&self.reloading);
		let closed = self.disconnect_everything().await;
		let drained = self.scheduler.shutdown(self.settings.scheduler_drain).await;
		info!(closed, drained, "orchestrator shut down");
	}
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
