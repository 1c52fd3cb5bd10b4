#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use donerelay_domain::{
	ChannelIdentity, ChatEvent, ConfigLoadError, DonationEvent, Platform, RelaySettings, RelaySnapshot, RewardRules,
};
use donerelay_platform::api::{ConnectTarget, CredentialSource};
use donerelay_platform::codec::{ChannelCredentials, ChzzkCodec, FrameCodec, SoopCodec};
use donerelay_platform::transport::{BoxFuture, ConnectRequest, Transport, WsConnector, memory};
use donerelay_platform::{
	CommandExecutor, DriverFactory, EventSink, FeatureGate, PlatformDriver, ReconnectPolicy, Scheduler, SecretString,
	SessionContext, SessionError, SessionSettings, SnapshotHandle,
};
use parking_lot::Mutex;

use crate::config::ChannelConfigProvider;
use crate::server::host::PresenceRegistry;
use crate::server::orchestrator::{Collaborators, Orchestrator, OrchestratorSettings};
use crate::server::pool::{PoolSettings, SessionPool};

/// In-memory network: every connect succeeds unless the channel id is marked offline.
#[derive(Default)]
pub struct FakeNet {
	connects: AtomicUsize,
	peers: Mutex<Vec<memory::Peer>>,
	offline: Mutex<HashSet<String>>,
}

impl FakeNet {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn connects(&self) -> usize {
		self.connects.load(Ordering::SeqCst)
	}

	pub fn set_offline(&self, external_id: &str, offline: bool) {
		let mut set = self.offline.lock();
		if offline {
			set.insert(external_id.to_string());
		} else {
			set.remove(external_id);
		}
	}
}

struct FakeCredentials(Arc<FakeNet>);

#[async_trait]
impl CredentialSource for FakeCredentials {
	async fn resolve(&self, identity: &ChannelIdentity) -> Result<ConnectTarget, SessionError> {
		if self.0.offline.lock().contains(&identity.external_id) {
			return Err(SessionError::Unavailable(format!("{identity} is offline")));
		}
		let credentials = match identity.platform {
			Platform::Chzzk => ChannelCredentials::Chzzk {
				chat_channel_id: format!("chat-{}", identity.external_id),
				access_token: SecretString::new("tok"),
			},
			Platform::Soop => ChannelCredentials::Soop {
				bj_id: identity.external_id.clone(),
				chat_no: "1".to_string(),
			},
		};
		Ok(ConnectTarget {
			request: ConnectRequest::new(format!("ws://memory.invalid/{}", identity.external_id)),
			credentials,
		})
	}
}

pub struct FakeDrivers(pub Arc<FakeNet>);

impl DriverFactory for FakeDrivers {
	fn driver(&self, platform: Platform, settings: &RelaySettings) -> PlatformDriver {
		let codec: Arc<dyn FrameCodec> = match platform {
			Platform::Chzzk => Arc::new(ChzzkCodec),
			Platform::Soop => Arc::new(SoopCodec::new(settings.soop_balloon_amounts)),
		};
		let net = Arc::clone(&self.0);
		let connector: WsConnector = Arc::new(move |_req: ConnectRequest| {
			let net = Arc::clone(&net);
			Box::pin(async move {
				net.connects.fetch_add(1, Ordering::SeqCst);
				let (transport, peer) = memory::pair();
				net.peers.lock().push(peer);
				Ok(transport)
			}) as BoxFuture<'static, anyhow::Result<Transport>>
		});
		PlatformDriver {
			codec,
			credentials: Arc::new(FakeCredentials(Arc::clone(&self.0))),
			connector,
		}
	}
}

#[derive(Default)]
pub struct RecordingExecutor {
	pub commands: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
	async fn submit(&self, command: String) -> anyhow::Result<bool> {
		self.commands.lock().push(command);
		Ok(true)
	}
}

#[derive(Default)]
pub struct RecordingSink {
	pub donations: Mutex<Vec<DonationEvent>>,
}

impl EventSink for RecordingSink {
	fn on_donation(&self, _channel: &ChannelIdentity, event: &DonationEvent) {
		self.donations.lock().push(event.clone());
	}

	fn on_chat(&self, _channel: &ChannelIdentity, _event: &ChatEvent) {}
}

pub struct Gate(pub AtomicBool);

impl FeatureGate for Gate {
	fn features_enabled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

/// Hands out whatever snapshot the test put in; `None` fails the load.
pub struct SwapProvider(pub Mutex<Option<RelaySnapshot>>);

impl SwapProvider {
	pub fn new(snapshot: RelaySnapshot) -> Arc<Self> {
		Arc::new(Self(Mutex::new(Some(snapshot))))
	}

	pub fn set(&self, snapshot: Option<RelaySnapshot>) {
		*self.0.lock() = snapshot;
	}
}

impl ChannelConfigProvider for SwapProvider {
	fn load(&self) -> Result<RelaySnapshot, ConfigLoadError> {
		self.0.lock().clone().ok_or(ConfigLoadError::NoChannels)
	}
}

pub fn channel(platform: Platform, tag: &str) -> ChannelIdentity {
	ChannelIdentity::new(platform, format!("{tag}-channel"), format!("{tag}-id"), tag).expect("identity")
}

pub fn snapshot(channels: Vec<ChannelIdentity>, auto_connect: bool) -> RelaySnapshot {
	let mut rewards = RewardRules::default();
	rewards.insert(1000, vec!["give %tag% diamond 1".to_string()]);
	let settings = RelaySettings {
		auto_connect,
		..RelaySettings::default()
	};
	RelaySnapshot::new(channels, rewards, settings).expect("snapshot")
}

pub fn fast_session() -> SessionSettings {
	SessionSettings {
		handshake_timeout: Duration::from_millis(500),
		connect_timeout: Duration::from_secs(1),
		heartbeat_interval: Duration::from_secs(3600),
		close_timeout: Duration::from_millis(100),
		command_timeout: Duration::from_millis(500),
		reconnect: ReconnectPolicy {
			initial_backoff: Duration::from_millis(10),
			max_backoff: Duration::from_millis(20),
			max_attempts: 1,
		},
		auto_reconnect: false,
		..SessionSettings::default()
	}
}

pub fn fast_settings() -> OrchestratorSettings {
	OrchestratorSettings {
		pool: PoolSettings {
			settle_delay: Duration::from_millis(10),
			disconnect_timeout: Duration::from_millis(500),
		},
		reload_settle: Duration::from_millis(10),
		reload_timeout: Duration::from_secs(2),
		scheduler_drain: Duration::from_millis(200),
		reconnect_pause: Duration::from_millis(10),
		command_timeout: Duration::from_millis(500),
	}
}

pub struct Rig {
	pub orch: Orchestrator,
	pub net: Arc<FakeNet>,
	pub provider: Arc<SwapProvider>,
	pub presence: Arc<PresenceRegistry>,
	pub executor: Arc<RecordingExecutor>,
	pub sink: Arc<RecordingSink>,
	pub gate: Arc<Gate>,
}

pub fn rig(initial: RelaySnapshot, online: &[&str]) -> Rig {
	let net = FakeNet::new();
	let provider = SwapProvider::new(initial);
	let presence = Arc::new(PresenceRegistry::new(online.iter().map(|t| t.to_string())));
	let executor = Arc::new(RecordingExecutor::default());
	let sink = Arc::new(RecordingSink::default());
	let gate = Arc::new(Gate(AtomicBool::new(true)));

	let orch = Orchestrator::new(
		Collaborators {
			executor: executor.clone(),
			sink: sink.clone(),
			presence: presence.clone(),
			gate: gate.clone(),
			drivers: Arc::new(FakeDrivers(net.clone())),
			provider: provider.clone(),
		},
		fast_session(),
		fast_settings(),
	);

	Rig {
		orch,
		net,
		provider,
		presence,
		executor,
		sink,
		gate,
	}
}

pub struct PoolRig {
	pub pool: Arc<SessionPool>,
	pub net: Arc<FakeNet>,
	pub gate: Arc<Gate>,
	pub snapshot: SnapshotHandle,
}

pub fn pool_rig(platform: Platform, initial: RelaySnapshot) -> PoolRig {
	let net = FakeNet::new();
	let gate = Arc::new(Gate(AtomicBool::new(true)));
	let snapshot = SnapshotHandle::new(initial);
	let ctx = Arc::new(SessionContext {
		scheduler: Scheduler::new(),
		executor: Arc::new(RecordingExecutor::default()),
		sink: Arc::new(RecordingSink::default()),
		presence: Arc::new(PresenceRegistry::default()),
		snapshot: snapshot.clone(),
		reloading: Arc::new(AtomicBool::new(false)),
		settings: fast_session(),
	});
	let pool = SessionPool::new(
		platform,
		ctx,
		Arc::new(FakeDrivers(net.clone())),
		gate.clone(),
		fast_settings().pool,
	);
	PoolRig {
		pool: Arc::new(pool),
		net,
		gate,
		snapshot,
	}
}
