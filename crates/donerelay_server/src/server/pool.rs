#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use donerelay_domain::{ChannelIdentity, Platform};
use donerelay_platform::{
	ConnectionSession, DriverFactory, FeatureGate, SessionContext, SessionError, SessionState, SessionStats,
};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
	/// Pause between draining the pool and opening fresh sessions.
	pub settle_delay: Duration,
	/// Upper bound on waiting for sessions to shut down.
	pub disconnect_timeout: Duration,
}

impl Default for PoolSettings {
	fn default() -> Self {
		Self {
			settle_delay: Duration::from_secs(2),
			disconnect_timeout: Duration::from_secs(5),
		}
	}
}

/// Result of a pool-wide connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
	Completed { connected: usize, total: usize },
	/// Another connect-all was already running.
	Rejected,
}

impl ConnectOutcome {
	pub fn connected(self) -> usize {
		match self {
			Self::Completed { connected, .. } => connected,
			Self::Rejected => 0,
		}
	}

	pub fn total(self) -> usize {
		match self {
			Self::Completed { total, .. } => total,
			Self::Rejected => 0,
		}
	}
}

/// One row of status output.
#[derive(Debug, Clone)]
pub struct SessionStatus {
	pub identity: ChannelIdentity,
	pub session_id: String,
	pub stats: SessionStats,
}

type Connecting = Pin<Box<dyn Future<Output = Result<(), SessionError>> + Send>>;

/// Holds an `AtomicBool` raised until dropped.
pub(crate) struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
	/// `None` when the flag is already raised.
	pub(crate) fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
		flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.ok()
			.map(|_| Self(flag))
	}

	pub(crate) fn raise(flag: &'a AtomicBool) -> Self {
		flag.store(true, Ordering::Release);
		Self(flag)
	}
}

impl Drop for FlagGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

/// Sessions for one platform. At most one session per channel lives here.
pub struct SessionPool {
	platform: Platform,
	ctx: Arc<SessionContext>,
	drivers: Arc<dyn DriverFactory>,
	gate: Arc<dyn FeatureGate>,
	sessions: Mutex<Vec<Arc<ConnectionSession>>>,
	connecting: AtomicBool,
	settings: PoolSettings,
}

impl SessionPool {
	pub fn new(
		platform: Platform,
		ctx: Arc<SessionContext>,
		drivers: Arc<dyn DriverFactory>,
		gate: Arc<dyn FeatureGate>,
		settings: PoolSettings,
	) -> Self {
		Self {
			platform,
			ctx,
			drivers,
			gate,
			sessions: Mutex::new(Vec::new()),
			connecting: AtomicBool::new(false),
			settings,
		}
	}

	pub fn platform(&self) -> Platform {
		self.platform
	}

	pub fn settings(&self) -> PoolSettings {
		self.settings
	}

	pub fn is_connecting(&self) -> bool {
		self.connecting.load(Ordering::Acquire)
	}

	pub fn len(&self) -> usize {
		self.sessions.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.lock().is_empty()
	}

	/// Sessions whose nickname or tag equals `target`.
	pub fn find(&self, target: &str) -> Vec<Arc<ConnectionSession>> {
		self.sessions
			.lock()
			.iter()
			.filter(|s| s.identity().matches(target))
			.cloned()
			.collect()
	}

	pub fn status(&self) -> Vec<SessionStatus> {
		self.sessions
			.lock()
			.iter()
			.map(|s| SessionStatus {
				identity: s.identity().clone(),
				session_id: s.id().to_string(),
				stats: s.stats(),
			})
			.collect()
	}

	/// Drain the pool, wait the settle delay, then connect every configured channel.
	/// A second call while one is running is rejected.
	pub async fn connect_all(&self) -> ConnectOutcome {
		let Some(_guard) = FlagGuard::try_acquire(&self.connecting) else {
			warn!(platform = %self.platform, "connect-all already in progress; request ignored");
			return ConnectOutcome::Rejected;
		};

		self.disconnect_all().await;
		sleep(self.settings.settle_delay).await;
		self.connect_identities(self.configured()).await
	}

	/// Connect every configured channel without draining first.
	pub async fn connect_configured(&self) -> ConnectOutcome {
		let Some(_guard) = FlagGuard::try_acquire(&self.connecting) else {
			warn!(platform = %self.platform, "connect-all already in progress; request ignored");
			return ConnectOutcome::Rejected;
		};

		self.connect_identities(self.configured()).await
	}

	/// Connect-if-absent for the configured channels carrying `tag`.
	pub async fn connect_for_tag(&self, tag: &str) -> ConnectOutcome {
		let matching: Vec<ChannelIdentity> = self.configured().into_iter().filter(|c| c.has_tag(tag)).collect();
		if matching.is_empty() {
			debug!(platform = %self.platform, %tag, "no channel configured for tag");
		}
		self.connect_identities(matching).await
	}

	fn configured(&self) -> Vec<ChannelIdentity> {
		self.ctx.snapshot.load().channels_for(self.platform).cloned().collect()
	}

	/// Connect each identity concurrently. Every connect runs as its own task, so
	/// a caller that stops waiting never leaves a session half-opened.
	pub async fn connect_identities(&self, identities: Vec<ChannelIdentity>) -> ConnectOutcome {
		let total = identities.len();
		let handles: Vec<_> = identities
			.into_iter()
			.map(|identity| {
				let connecting = self.claim(identity);
				tokio::spawn(connecting)
			})
			.collect();

		let mut connected = 0;
		for res in join_all(handles).await {
			match res {
				Ok(Ok(())) => connected += 1,
				Ok(Err(e)) => debug!(platform = %self.platform, error = %e, "channel did not connect"),
				Err(e) => warn!(platform = %self.platform, error = %e, "connect task failed"),
			}
		}

		info!(platform = %self.platform, connected, total, "connect finished");
		ConnectOutcome::Completed { connected, total }
	}

	/// Connect one channel unless a live session for it already exists.
	///
	/// An existing active session counts as success. A DISCONNECTED one (retries
	/// exhausted or self-reconnect off) is replaced.
	pub async fn connect_one(&self, identity: ChannelIdentity) -> Result<(), SessionError> {
		self.claim(identity).await
	}

	fn claim(&self, identity: ChannelIdentity) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
		let platform = self.platform;
		let started = self.start_session(identity);
		async move {
			match started {
				Ok(Some(connecting)) => match connecting.await {
					Err(SessionError::DuplicateConnection) => Ok(()),
					other => other,
				},
				Ok(None) => Ok(()),
				Err(e) => {
					warn!(%platform, error = %e, "connect refused");
					Err(e)
				}
			}
		}
	}

	/// Insert and claim a session under the pool lock. `None` when one is already live.
	fn start_session(&self, identity: ChannelIdentity) -> Result<Option<Connecting>, SessionError> {
		if !self.gate.features_enabled() {
			return Err(SessionError::Unavailable("relay features are disabled on this host".to_string()));
		}
		if identity.platform != self.platform {
			return Err(SessionError::Unavailable(format!("{identity} does not belong to the {} pool", self.platform)));
		}

		let (connecting, replaced) = {
			let mut sessions = self.sessions.lock();
			let existing = sessions.iter().position(|s| s.identity().same_channel(&identity));

			let mut replaced = None;
			if let Some(idx) = existing {
				let state = sessions[idx].state();
				if state.is_active() {
					debug!(platform = %self.platform, channel = %identity.nickname, %state, "already connected");
					return Ok(None);
				}
				replaced = Some(sessions.swap_remove(idx));
			}

			let driver = self.drivers.driver(self.platform, &self.ctx.snapshot.load().settings());
			let session = ConnectionSession::new(identity, driver, Arc::clone(&self.ctx));
			let connecting = session.connect();
			sessions.push(session);
			(connecting, replaced)
		};

		if let Some(old) = replaced {
			debug!(platform = %self.platform, channel = %old.identity().nickname, "replacing disconnected session");
			tokio::spawn(async move { old.shutdown().await });
		}

		Ok(Some(Box::pin(connecting)))
	}

	/// Shut down every session concurrently, waiting at most the disconnect timeout.
	pub async fn disconnect_all(&self) -> usize {
		let drained = std::mem::take(&mut *self.sessions.lock());
		self.shutdown_sessions(drained, "all").await
	}

	/// Shut down sessions whose nickname or tag equals `target`.
	pub async fn disconnect_target(&self, target: &str) -> usize {
		let removed = {
			let mut sessions = self.sessions.lock();
			let (matching, rest): (Vec<_>, Vec<_>) =
				std::mem::take(&mut *sessions).into_iter().partition(|s| s.identity().matches(target));
			*sessions = rest;
			matching
		};
		self.shutdown_sessions(removed, target).await
	}

	async fn shutdown_sessions(&self, sessions: Vec<Arc<ConnectionSession>>, target: &str) -> usize {
		let count = sessions.len();
		if count == 0 {
			return 0;
		}

		let handles: Vec<_> = sessions
			.into_iter()
			.map(|s| tokio::spawn(async move { s.shutdown().await }))
			.collect();

		let limit = self.settings.disconnect_timeout;
		match timeout(limit, join_all(handles)).await {
			Ok(_) => info!(platform = %self.platform, %target, count, "sessions disconnected"),
			Err(_) => warn!(
				platform = %self.platform,
				%target,
				count,
				?limit,
				"sessions did not finish shutting down in time; abandoning"
			),
		}
		count
	}

	/// Sessions currently CONNECTED.
	pub fn connected_count(&self) -> usize {
		self.sessions
			.lock()
			.iter()
			.filter(|s| s.state() == SessionState::Connected)
			.count()
	}
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
