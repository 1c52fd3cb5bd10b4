#![forbid(unsafe_code)]

//! One live (or retrying) connection to one channel's chat feed.
//!
//! State changes happen under a single per-session lock. Reconnects are posted
//! to the shared [`Scheduler`] instead of recursing, and every connection gets
//! a generation number so callbacks from a dead socket cannot touch a newer one.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use donerelay_domain::{ChannelIdentity, ChatEvent, DonationEvent};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{AuthOutcome, ChannelCredentials, Frame};
use crate::driver::PlatformDriver;
use crate::error::SessionError;
use crate::reconnect::ReconnectPolicy;
use crate::reward::{DEFAULT_COMMAND_TIMEOUT, RewardDispatcher, render_template};
use crate::scheduler::Scheduler;
use crate::snapshot::SnapshotHandle;
use crate::transport::{Transport, WsSink, WsSource};
use crate::{CommandExecutor, EventSink, PresenceResolver, new_session_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
	Disconnected,
	Connecting,
	Connected,
	Reconnecting,
	/// Terminal.
	ShuttingDown,
}

impl SessionState {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Disconnected => "disconnected",
			Self::Connecting => "connecting",
			Self::Connected => "connected",
			Self::Reconnecting => "reconnecting",
			Self::ShuttingDown => "shutting_down",
		}
	}

	/// Connected, or working on becoming connected.
	pub const fn is_active(self) -> bool {
		matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
	}
}

impl fmt::Display for SessionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Timing and retry knobs shared by every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
	/// Websocket handshake, and each single write including the wait for the writer.
	pub handshake_timeout: Duration,
	/// Whole connect budget: credential lookup, handshake and state change.
	pub connect_timeout: Duration,
	pub heartbeat_interval: Duration,
	pub close_timeout: Duration,
	pub auth_send_attempts: u32,
	pub auth_retry_delay: Duration,
	pub command_timeout: Duration,
	pub reconnect: ReconnectPolicy,
	/// Reconnect on our own after a drop; reload always suppresses this.
	pub auto_reconnect: bool,
	/// Optional command template submitted for each relayed chat line.
	pub chat_relay_command: Option<String>,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			handshake_timeout: Duration::from_secs(5),
			connect_timeout: Duration::from_secs(10),
			heartbeat_interval: Duration::from_secs(20),
			close_timeout: Duration::from_secs(5),
			auth_send_attempts: 3,
			auth_retry_delay: Duration::from_millis(500),
			command_timeout: DEFAULT_COMMAND_TIMEOUT,
			reconnect: ReconnectPolicy::default(),
			auto_reconnect: true,
			chat_relay_command: None,
		}
	}
}

/// Collaborators handed to every session at construction.
pub struct SessionContext {
	pub scheduler: Scheduler,
	pub executor: Arc<dyn CommandExecutor>,
	pub sink: Arc<dyn EventSink>,
	pub presence: Arc<dyn PresenceResolver>,
	pub snapshot: SnapshotHandle,
	/// Set by the orchestrator during reload.
	pub reloading: Arc<AtomicBool>,
	pub settings: SessionSettings,
}

/// Point-in-time view for status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
	pub state: SessionState,
	pub reconnect_attempts: u32,
	pub messages: u64,
	pub donations: u64,
}

struct Inner {
	state: SessionState,
	reconnect_attempts: u32,
	generation: u64,
	link: Option<CancellationToken>,
	credentials: Option<Arc<ChannelCredentials>>,
}

struct Writer {
	generation: u64,
	sink: WsSink,
}

pub struct ConnectionSession {
	id: String,
	identity: Arc<ChannelIdentity>,
	driver: PlatformDriver,
	ctx: Arc<SessionContext>,
	dispatcher: Arc<RewardDispatcher>,
	inner: Mutex<Inner>,
	writer: tokio::sync::Mutex<Option<Writer>>,
	shutdown: CancellationToken,
	donations: mpsc::UnboundedSender<DonationEvent>,
	messages: AtomicU64,
	donation_count: AtomicU64,
}

impl fmt::Debug for ConnectionSession {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConnectionSession")
			.field("id", &self.id)
			.field("identity", &self.identity)
			.field("state", &self.state())
			.finish()
	}
}

impl ConnectionSession {
	/// Must be called inside a tokio runtime.
	pub fn new(identity: ChannelIdentity, driver: PlatformDriver, ctx: Arc<SessionContext>) -> Arc<Self> {
		let identity = Arc::new(identity);
		let dispatcher = Arc::new(RewardDispatcher::new(
			identity.platform,
			ctx.snapshot.clone(),
			Arc::clone(&ctx.executor),
			ctx.settings.command_timeout,
		));
		let shutdown = CancellationToken::new();
		let (donations, donations_rx) = mpsc::unbounded_channel();

		tokio::spawn(reward_worker(
			Arc::clone(&identity),
			Arc::clone(&dispatcher),
			shutdown.clone(),
			donations_rx,
		));

		Arc::new(Self {
			id: new_session_id(),
			identity,
			driver,
			ctx,
			dispatcher,
			inner: Mutex::new(Inner {
				state: SessionState::Disconnected,
				reconnect_attempts: 0,
				generation: 0,
				link: None,
				credentials: None,
			}),
			writer: tokio::sync::Mutex::new(None),
			shutdown,
			donations,
			messages: AtomicU64::new(0),
			donation_count: AtomicU64::new(0),
		})
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn identity(&self) -> &ChannelIdentity {
		&self.identity
	}

	pub fn state(&self) -> SessionState {
		self.inner.lock().state
	}

	pub fn reconnect_attempts(&self) -> u32 {
		self.inner.lock().reconnect_attempts
	}

	pub fn dispatcher(&self) -> &RewardDispatcher {
		&self.dispatcher
	}

	pub fn stats(&self) -> SessionStats {
		let inner = self.inner.lock();
		SessionStats {
			state: inner.state,
			reconnect_attempts: inner.reconnect_attempts,
			messages: self.messages.load(Ordering::Relaxed),
			donations: self.donation_count.load(Ordering::Relaxed),
		}
	}

	/// Open the socket, authenticate and start the heartbeat.
	///
	/// The move to CONNECTING happens when this is called, not when the returned
	/// future is first polled, so a caller holding a lock can claim the session.
	///
	/// `DuplicateConnection` when already connected or connecting. On failure the
	/// session enters the reconnect path on its own.
	pub fn connect(self: &Arc<Self>) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
		let claimed = {
			let mut inner = self.inner.lock();
			match inner.state {
				SessionState::ShuttingDown => Err(SessionError::ShuttingDown),
				SessionState::Connected | SessionState::Connecting => Err(SessionError::DuplicateConnection),
				SessionState::Disconnected | SessionState::Reconnecting => {
					inner.state = SessionState::Connecting;
					Ok(())
				}
			}
		};
		let this = Arc::clone(self);
		async move {
			claimed?;
			this.establish().await
		}
	}

	/// Send a frame on the current connection. Failure drops the connection.
	pub async fn send(self: &Arc<Self>, msg: Message) -> Result<(), SessionError> {
		let generation = {
			let inner = self.inner.lock();
			if inner.state != SessionState::Connected {
				return Err(SessionError::NotConnected);
			}
			inner.generation
		};
		self.send_on(generation, msg).await
	}

	/// Stop for good: cancel timers and pending commands, close the socket.
	/// Calling it again is a no-op.
	pub async fn shutdown(&self) {
		let link = {
			let mut inner = self.inner.lock();
			if inner.state == SessionState::ShuttingDown {
				debug!(platform = %self.identity.platform, channel = %self.identity.nickname, "shutdown already requested");
				return;
			}
			inner.state = SessionState::ShuttingDown;
			inner.link.take()
		};

		let aborted = self.dispatcher.cancel_pending();
		self.shutdown.cancel();
		if let Some(link) = link {
			link.cancel();
		}

		// Waiting for the writer counts against the close budget.
		let close_timeout = self.ctx.settings.close_timeout;
		let closing = async {
			let Some(mut w) = self.writer.lock().await.take() else {
				return Ok(());
			};
			w.sink
				.send(Message::Close(Some(CloseFrame {
					code: CloseCode::Normal,
					reason: "shutdown requested".into(),
				})))
				.await?;
			w.sink.close().await
		};
		match timeout(close_timeout, closing).await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => debug!(channel = %self.identity.nickname, error = %e, "close handshake failed"),
			Err(_) => warn!(channel = %self.identity.nickname, ?close_timeout, "transport close timed out; abandoning"),
		}

		info!(
			platform = %self.identity.platform,
			channel = %self.identity.nickname,
			aborted_commands = aborted,
			"session shut down"
		);
	}

	async fn establish(self: &Arc<Self>) -> Result<(), SessionError> {
		let budget = self.ctx.settings.connect_timeout;
		let opened = match timeout(budget, self.open_link()).await {
			Ok(res) => res,
			Err(_) => Err(SessionError::Timeout(budget)),
		};

		let (generation, link, credentials) = match opened {
			Ok(v) => v,
			Err(e) => {
				self.fail_connecting(&e);
				return Err(e);
			}
		};

		self.authenticate(generation, link, &credentials).await
	}

	async fn open_link(self: &Arc<Self>) -> Result<(u64, CancellationToken, Arc<ChannelCredentials>), SessionError> {
		let target = self.driver.credentials.resolve(&self.identity).await?;

		let handshake = self.ctx.settings.handshake_timeout;
		let Transport { sink, source } = match timeout(handshake, (self.driver.connector)(target.request.clone())).await {
			Ok(Ok(t)) => t,
			Ok(Err(e)) => return Err(SessionError::Transport(format!("{e:#}"))),
			Err(_) => return Err(SessionError::Timeout(handshake)),
		};
		let credentials = Arc::new(target.credentials);

		let mut writer = self.writer.lock().await;
		let (generation, link) = {
			let mut inner = self.inner.lock();
			if inner.state != SessionState::Connecting {
				return Err(SessionError::ShuttingDown);
			}
			inner.generation += 1;
			let link = self.shutdown.child_token();
			inner.state = SessionState::Connected;
			inner.link = Some(link.clone());
			inner.credentials = Some(Arc::clone(&credentials));
			(inner.generation, link)
		};
		*writer = Some(Writer { generation, sink });
		drop(writer);

		metrics::counter!("donerelay_session_connects_total", "platform" => self.identity.platform.as_str()).increment(1);
		info!(
			platform = %self.identity.platform,
			channel = %self.identity.nickname,
			url = %target.request.url,
			generation,
			"chat socket connected"
		);

		tokio::spawn(Arc::clone(self).read_loop(generation, source, link.clone()));
		Ok((generation, link, credentials))
	}

	async fn authenticate(
		self: &Arc<Self>,
		generation: u64,
		link: CancellationToken,
		credentials: &ChannelCredentials,
	) -> Result<(), SessionError> {
		let frame = match self.driver.codec.encode_auth(credentials) {
			Ok(frame) => frame,
			Err(e) => {
				self.link_lost(generation, &e.to_string());
				return Err(e);
			}
		};

		let attempts = self.ctx.settings.auth_send_attempts.max(1);
		let mut last_err = SessionError::NotConnected;
		for attempt in 1..=attempts {
			match self.send_raw(generation, frame.clone()).await {
				Ok(()) => {
					debug!(channel = %self.identity.nickname, attempt, "auth frame sent");
					self.start_heartbeat(generation, link);
					return Ok(());
				}
				Err(e) => {
					warn!(channel = %self.identity.nickname, attempt, error = %e, "auth frame send failed");
					let stalled = matches!(e, SessionError::Timeout(_));
					last_err = e;
					if !stalled && attempt < attempts && self.is_link_open(generation) {
						sleep(self.ctx.settings.auth_retry_delay).await;
					} else {
						break;
					}
				}
			}
		}

		self.link_lost(generation, "auth frame could not be sent");
		Err(last_err)
	}

	fn is_link_open(&self, generation: u64) -> bool {
		let inner = self.inner.lock();
		inner.state == SessionState::Connected && inner.generation == generation
	}

	/// One write, bounded by the handshake timeout including the wait for the writer.
	async fn send_raw(&self, generation: u64, msg: Message) -> Result<(), SessionError> {
		let limit = self.ctx.settings.handshake_timeout;
		let sending = async {
			let mut writer = self.writer.lock().await;
			match writer.as_mut() {
				Some(w) if w.generation == generation => w.sink.send(msg).await.map_err(SessionError::transport),
				_ => Err(SessionError::NotConnected),
			}
		};
		timeout(limit, sending)
			.await
			.unwrap_or_else(|_| Err(SessionError::Timeout(limit)))
	}

	async fn send_on(self: &Arc<Self>, generation: u64, msg: Message) -> Result<(), SessionError> {
		let res = self.send_raw(generation, msg).await;
		if let Err(e) = &res
			&& !matches!(e, SessionError::NotConnected)
		{
			self.link_lost(generation, &format!("send failed: {e}"));
		}
		res
	}

	/// CONNECTING -> DISCONNECTED, then consult the reconnect policy.
	fn fail_connecting(self: &Arc<Self>, err: &SessionError) {
		{
			let mut inner = self.inner.lock();
			if inner.state != SessionState::Connecting {
				return;
			}
			inner.state = SessionState::Disconnected;
		}
		warn!(platform = %self.identity.platform, channel = %self.identity.nickname, error = %err, "connect failed");
		self.schedule_reconnect();
	}

	/// CONNECTED -> DISCONNECTED for `generation`; stale generations are ignored.
	fn link_lost(self: &Arc<Self>, generation: u64, reason: &str) {
		let link = {
			let mut inner = self.inner.lock();
			if inner.generation != generation || inner.state != SessionState::Connected {
				return;
			}
			inner.state = SessionState::Disconnected;
			inner.link.take()
		};
		if let Some(link) = link {
			link.cancel();
		}

		metrics::counter!("donerelay_session_disconnects_total", "platform" => self.identity.platform.as_str()).increment(1);
		warn!(platform = %self.identity.platform, channel = %self.identity.nickname, generation, %reason, "chat socket lost");

		let this = Arc::clone(self);
		tokio::spawn(async move { this.release_writer(generation).await });

		self.schedule_reconnect();
	}

	async fn release_writer(&self, generation: u64) {
		let close_timeout = self.ctx.settings.close_timeout;
		let Ok(mut writer) = timeout(close_timeout, self.writer.lock()).await else {
			debug!(channel = %self.identity.nickname, generation, "writer busy; stale sink left for the next connect");
			return;
		};
		let stale = match writer.as_ref() {
			Some(w) if w.generation == generation => writer.take(),
			_ => None,
		};
		drop(writer);
		if let Some(mut w) = stale {
			let _ = timeout(close_timeout, w.sink.close()).await;
		}
	}

	fn schedule_reconnect(self: &Arc<Self>) {
		if !self.ctx.settings.auto_reconnect {
			info!(channel = %self.identity.nickname, "self-reconnect disabled; staying disconnected");
			return;
		}
		if self.ctx.reloading.load(Ordering::SeqCst) {
			info!(channel = %self.identity.nickname, "reload in progress; leaving reconnect to the orchestrator");
			return;
		}

		let (delay, attempt) = {
			let mut inner = self.inner.lock();
			if inner.state != SessionState::Disconnected {
				return;
			}
			let Some(delay) = self.ctx.settings.reconnect.next_delay(inner.reconnect_attempts) else {
				metrics::counter!("donerelay_session_permanent_failures_total", "platform" => self.identity.platform.as_str())
					.increment(1);
				error!(
					platform = %self.identity.platform,
					channel = %self.identity.nickname,
					attempts = inner.reconnect_attempts,
					"reconnect attempts exhausted; channel stays disconnected"
				);
				return;
			};
			inner.reconnect_attempts += 1;
			inner.state = SessionState::Reconnecting;
			(delay, inner.reconnect_attempts)
		};

		info!(channel = %self.identity.nickname, attempt, ?delay, "reconnect scheduled");
		let this = Arc::clone(self);
		let stop = self.shutdown.clone();
		self.ctx.scheduler.spawn(async move {
			tokio::select! {
				_ = stop.cancelled() => {}
				_ = sleep(delay) => this.reconnect_now().await,
			}
		});
	}

	async fn reconnect_now(self: Arc<Self>) {
		{
			let mut inner = self.inner.lock();
			if inner.state != SessionState::Reconnecting {
				return;
			}
			if self.ctx.reloading.load(Ordering::SeqCst) {
				inner.state = SessionState::Disconnected;
				info!(channel = %self.identity.nickname, "reload in progress; scheduled reconnect abandoned");
				return;
			}
			inner.state = SessionState::Connecting;
		}

		metrics::counter!("donerelay_session_reconnect_attempts_total", "platform" => self.identity.platform.as_str())
			.increment(1);
		if let Err(e) = self.establish().await {
			debug!(channel = %self.identity.nickname, error = %e, "reconnect attempt failed");
		}
	}

	fn start_heartbeat(self: &Arc<Self>, generation: u64, link: CancellationToken) {
		let this = Arc::clone(self);
		let period = self.ctx.settings.heartbeat_interval.max(Duration::from_millis(1));

		self.ctx.scheduler.spawn(async move {
			let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					_ = link.cancelled() => break,
					_ = ticker.tick() => {
						if !this.is_link_open(generation) {
							continue;
						}
						let frame = this.driver.codec.encode_heartbeat();
						tokio::select! {
							_ = link.cancelled() => break,
							sent = this.send_on(generation, frame) => {
								if sent.is_err() {
									break;
								}
								trace!(channel = %this.identity.nickname, "heartbeat sent");
							}
						}
					}
				}
			}
		});
	}

	async fn read_loop(self: Arc<Self>, generation: u64, mut source: WsSource, link: CancellationToken) {
		loop {
			let next = tokio::select! {
				_ = link.cancelled() => return,
				next = source.next() => next,
			};

			match next {
				None => {
					self.link_lost(generation, "remote closed the stream");
					return;
				}
				Some(Err(e)) => {
					self.link_lost(generation, &format!("transport error: {e}"));
					return;
				}
				Some(Ok(Message::Close(frame))) => {
					let reason = frame
						.map(|f| format!("remote close {}: {}", f.code, f.reason.as_str()))
						.unwrap_or_else(|| "remote close".to_string());
					self.link_lost(generation, &reason);
					return;
				}
				Some(Ok(Message::Ping(payload))) => {
					let _ = self.send_on(generation, Message::Pong(payload)).await;
				}
				Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => self.on_frame(generation, &msg).await,
				Some(Ok(_)) => {}
			}
		}
	}

	async fn on_frame(self: &Arc<Self>, generation: u64, raw: &Message) {
		let frame = match self.driver.codec.decode(raw) {
			Ok(Some(frame)) => frame,
			Ok(None) => return,
			Err(e) => {
				metrics::counter!("donerelay_frames_dropped_total", "platform" => self.identity.platform.as_str()).increment(1);
				warn!(channel = %self.identity.nickname, error = %e, "dropping undecodable frame");
				return;
			}
		};
		self.messages.fetch_add(1, Ordering::Relaxed);

		match frame {
			Frame::Heartbeat => {
				let ack = self.driver.codec.encode_heartbeat_ack();
				let _ = self.send_on(generation, ack).await;
			}
			Frame::HeartbeatAck => trace!(channel = %self.identity.nickname, "heartbeat acknowledged"),
			Frame::AuthAck(AuthOutcome::Accepted) => {
				info!(platform = %self.identity.platform, channel = %self.identity.nickname, "authenticated");
				// Retries count until the server accepts us, not until the socket opens.
				let credentials = {
					let mut inner = self.inner.lock();
					if inner.generation == generation {
						inner.reconnect_attempts = 0;
					}
					inner.credentials.clone()
				};
				if let Some(credentials) = credentials
					&& let Some(follow_up) = self.driver.codec.encode_after_auth(&credentials)
				{
					let _ = self.send_on(generation, follow_up).await;
				}
			}
			Frame::AuthAck(AuthOutcome::Rejected(reason)) => {
				let err = SessionError::Auth(reason);
				self.link_lost(generation, &err.to_string());
			}
			Frame::Chat(ev) => self.relay_chat(ev),
			Frame::Donation(ev) => self.accept_donation(ev),
			Frame::Unknown(code) => debug!(channel = %self.identity.nickname, %code, "unhandled frame"),
		}
	}

	fn accept_donation(&self, ev: DonationEvent) {
		self.donation_count.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("donerelay_donations_total", "platform" => self.identity.platform.as_str()).increment(1);
		info!(
			platform = %self.identity.platform,
			channel = %self.identity.nickname,
			donor = %ev.donor_name,
			amount = ev.amount,
			"donation received"
		);

		self.ctx.sink.on_donation(&self.identity, &ev);
		if self.donations.send(ev).is_err() {
			debug!(channel = %self.identity.nickname, "reward worker stopped; donation not rewarded");
		}
	}

	fn relay_chat(&self, ev: ChatEvent) {
		metrics::counter!("donerelay_chat_messages_total", "platform" => self.identity.platform.as_str()).increment(1);

		if !self.ctx.presence.is_known(&self.identity.tag) {
			warn!(channel = %self.identity.nickname, tag = %self.identity.tag, "chat target unresolvable; not relayed");
			return;
		}
		self.ctx.sink.on_chat(&self.identity, &ev);

		let Some(template) = &self.ctx.settings.chat_relay_command else {
			return;
		};
		let command = render_template(
			template,
			&[
				("%tag%", self.identity.tag.as_str()),
				("%name%", ev.sender_name.as_str()),
				("%message%", ev.text.as_str()),
				("%platform%", self.identity.platform.as_str()),
				("%role%", ev.role.as_str()),
			],
		);
		let executor = Arc::clone(&self.ctx.executor);
		let limit = self.ctx.settings.command_timeout;
		tokio::spawn(async move {
			match timeout(limit, executor.submit(command)).await {
				Ok(Ok(true)) => {}
				Ok(Ok(false)) => debug!("chat relay command rejected"),
				Ok(Err(e)) => warn!(error = %e, "chat relay command failed"),
				Err(_) => warn!(?limit, "chat relay command timed out"),
			}
		});
	}
}

async fn reward_worker(
	identity: Arc<ChannelIdentity>,
	dispatcher: Arc<RewardDispatcher>,
	shutdown: CancellationToken,
	mut rx: mpsc::UnboundedReceiver<DonationEvent>,
) {
	loop {
		let ev = tokio::select! {
			_ = shutdown.cancelled() => break,
			ev = rx.recv() => match ev {
				Some(ev) => ev,
				None => break,
			},
		};
		dispatcher
			.dispatch(&identity, &ev.donor_name, ev.amount, &ev.message)
			.await;
	}
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
