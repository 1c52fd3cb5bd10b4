#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;
use donerelay_domain::{ChannelIdentity, ConfigLoadError, Platform, RelaySettings, RelaySnapshot, RewardRules};
use donerelay_platform::api::{ChzzkApiConfig, SoopApiConfig};
use donerelay_platform::{ReconnectPolicy, SessionSettings};
use serde::Deserialize;
use tracing::{info, warn};

const CONFIG_PATH_ENV: &str = "DONERELAY_CONFIG";

/// Default config path: `~/.donerelay/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".donerelay").join("config.toml"))
}

/// `--config` wins over `DONERELAY_CONFIG`, which wins over the default path.
pub fn resolve_config_path(cli: Option<PathBuf>) -> anyhow::Result<PathBuf> {
	if let Some(path) = cli {
		return Ok(path);
	}
	if let Ok(v) = std::env::var(CONFIG_PATH_ENV) {
		let v = v.trim();
		if !v.is_empty() {
			return Ok(PathBuf::from(v));
		}
	}
	default_config_path()
}

/// Yields the validated channel list and reward rules; called at startup and on reload.
pub trait ChannelConfigProvider: Send + Sync + 'static {
	fn load(&self) -> Result<RelaySnapshot, ConfigLoadError>;
}

/// Reads the TOML file (plus env overrides) on every load.
///
/// Only channels, rewards and toggles are reloadable. `[connection]` and
/// `[chat]` are fixed at startup; a reload that changes them logs a warning.
#[derive(Debug, Clone)]
pub struct FileConfigProvider {
	path: PathBuf,
	startup: Option<ConnectionSettings>,
}

impl FileConfigProvider {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			startup: None,
		}
	}

	/// Remember the settings the process started with, to flag restart-only edits.
	pub fn with_startup(mut self, runtime: &RuntimeConfig) -> Self {
		self.startup = Some(runtime.connection.clone());
		self
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl ChannelConfigProvider for FileConfigProvider {
	fn load(&self) -> Result<RelaySnapshot, ConfigLoadError> {
		let cfg = load_config_from_path(&self.path)?;
		if let Some(startup) = &self.startup {
			let changed = restart_only_changes(startup, &cfg.runtime.connection);
			if !changed.is_empty() {
				warn!(
					path = %self.path.display(),
					sections = ?changed,
					"changed settings take effect after a restart; reload keeps the running values"
				);
			}
		}
		cfg.snapshot()
	}
}

/// Sections whose edits a reload cannot apply.
fn restart_only_changes(startup: &ConnectionSettings, loaded: &ConnectionSettings) -> Vec<&'static str> {
	let mut changed = Vec::new();
	if startup.session.chat_relay_command != loaded.session.chat_relay_command {
		changed.push("chat");
	}
	let without_chat = |c: &ConnectionSettings| {
		let mut c = c.clone();
		c.session.chat_relay_command = None;
		c
	};
	if without_chat(startup) != without_chat(loaded) {
		changed.push("connection");
	}
	changed
}

/// Everything the file describes, before the channel list is frozen into a snapshot.
#[derive(Debug, Clone)]
pub struct RelayConfig {
	pub channels: Vec<ChannelIdentity>,
	pub rewards: RewardRules,
	pub settings: RelaySettings,
	pub runtime: RuntimeConfig,
}

impl RelayConfig {
	pub fn snapshot(&self) -> Result<RelaySnapshot, ConfigLoadError> {
		RelaySnapshot::new(self.channels.clone(), self.rewards.clone(), self.settings)
	}
}

/// Settings read once at startup; reload does not change them.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
	pub connection: ConnectionSettings,
	pub chzzk_api: ChzzkApiConfig,
	pub soop_api: SoopApiConfig,
	pub chat: ChatSettings,
	/// Tags that start out online.
	pub presence: Vec<String>,
	pub server: ServerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
	pub session: SessionSettings,
	/// Pause between disconnect-all and reconnect inside one pool.
	pub settle_delay: Duration,
	pub disconnect_timeout: Duration,
	pub reload_settle: Duration,
	pub reload_timeout: Duration,
	pub scheduler_drain: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			session: SessionSettings::default(),
			settle_delay: Duration::from_secs(2),
			disconnect_timeout: Duration::from_secs(5),
			reload_settle: Duration::from_secs(5),
			reload_timeout: Duration::from_secs(60),
			scheduler_drain: Duration::from_secs(5),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct ChatSettings {
	pub relay_command: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	random_reward: Option<bool>,
	auto_connect: Option<bool>,
	soop_balloon_amounts: Option<bool>,

	#[serde(default)]
	chzzk: BTreeMap<String, FileChannel>,
	#[serde(default)]
	soop: BTreeMap<String, FileChannel>,
	#[serde(default)]
	afreeca: BTreeMap<String, FileChannel>,

	#[serde(default)]
	rewards: BTreeMap<String, FileTemplates>,

	#[serde(default)]
	connection: FileConnectionSettings,
	#[serde(default)]
	chzzk_api: FileChzzkApi,
	#[serde(default)]
	soop_api: FileSoopApi,
	#[serde(default)]
	chat: FileChat,
	#[serde(default)]
	presence: FilePresence,
	#[serde(default)]
	server: FileServerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChannel {
	id: Option<String>,
	tag: Option<String>,
	#[serde(flatten)]
	extra: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FileTemplates {
	One(String),
	Many(Vec<String>),
}

impl FileTemplates {
	fn into_vec(self) -> Vec<String> {
		match self {
			Self::One(t) => vec![t],
			Self::Many(ts) => ts,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConnectionSettings {
	handshake_timeout_ms: Option<u64>,
	connect_timeout_ms: Option<u64>,
	heartbeat_interval_secs: Option<u64>,
	close_timeout_ms: Option<u64>,
	auth_send_attempts: Option<u32>,
	auth_retry_delay_ms: Option<u64>,
	command_timeout_ms: Option<u64>,
	reconnect_initial_ms: Option<u64>,
	reconnect_max_ms: Option<u64>,
	reconnect_max_attempts: Option<u32>,
	session_auto_reconnect: Option<bool>,
	settle_delay_ms: Option<u64>,
	disconnect_timeout_ms: Option<u64>,
	reload_settle_ms: Option<u64>,
	reload_timeout_secs: Option<u64>,
	scheduler_drain_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChzzkApi {
	api_base: Option<String>,
	game_base: Option<String>,
	chat_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSoopApi {
	live_api_base: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChat {
	relay_command: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePresence {
	#[serde(default)]
	online: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn raw_value(v: &toml::Value) -> String {
	match v {
		toml::Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

fn channel_from_file(platform: Platform, nickname: &str, file: FileChannel) -> Result<ChannelIdentity, ConfigLoadError> {
	let missing = |field| ConfigLoadError::MissingField {
		platform,
		nickname: nickname.to_string(),
		field,
	};
	let id = non_empty(file.id).ok_or_else(|| missing("id"))?;
	let tag = non_empty(file.tag).ok_or_else(|| missing("tag"))?;

	let mut raw: BTreeMap<String, String> = file.extra.iter().map(|(k, v)| (k.clone(), raw_value(v))).collect();
	raw.insert("id".to_string(), id.clone());
	raw.insert("tag".to_string(), tag.clone());

	let identity = ChannelIdentity::new(platform, nickname.trim(), id, tag).map_err(|_| missing("nickname"))?;
	Ok(identity.with_raw(raw))
}

fn ms(v: Option<u64>, default: Duration) -> Duration {
	v.map(Duration::from_millis).unwrap_or(default)
}

impl ConnectionSettings {
	fn from_file(file: FileConnectionSettings) -> Self {
		let d = Self::default();
		let session_default = SessionSettings::default();
		let reconnect_default = ReconnectPolicy::default();

		let session = SessionSettings {
			handshake_timeout: ms(file.handshake_timeout_ms, session_default.handshake_timeout),
			connect_timeout: ms(file.connect_timeout_ms, session_default.connect_timeout),
			heartbeat_interval: file
				.heartbeat_interval_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(session_default.heartbeat_interval),
			close_timeout: ms(file.close_timeout_ms, session_default.close_timeout),
			auth_send_attempts: file
				.auth_send_attempts
				.filter(|v| *v > 0)
				.unwrap_or(session_default.auth_send_attempts),
			auth_retry_delay: ms(file.auth_retry_delay_ms, session_default.auth_retry_delay),
			command_timeout: ms(file.command_timeout_ms, session_default.command_timeout),
			reconnect: ReconnectPolicy {
				initial_backoff: ms(file.reconnect_initial_ms, reconnect_default.initial_backoff),
				max_backoff: ms(file.reconnect_max_ms, reconnect_default.max_backoff),
				max_attempts: file.reconnect_max_attempts.unwrap_or(reconnect_default.max_attempts),
			},
			auto_reconnect: file.session_auto_reconnect.unwrap_or(session_default.auto_reconnect),
			chat_relay_command: None,
		};

		Self {
			session,
			settle_delay: ms(file.settle_delay_ms, d.settle_delay),
			disconnect_timeout: ms(file.disconnect_timeout_ms, d.disconnect_timeout),
			reload_settle: ms(file.reload_settle_ms, d.reload_settle),
			reload_timeout: file
				.reload_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(d.reload_timeout),
			scheduler_drain: ms(file.scheduler_drain_ms, d.scheduler_drain),
		}
	}
}

impl RelayConfig {
	fn from_file(file: FileConfig) -> Result<Self, ConfigLoadError> {
		let mut channels = Vec::new();
		for (nickname, ch) in file.chzzk {
			channels.push(channel_from_file(Platform::Chzzk, &nickname, ch)?);
		}
		// `[afreeca]` is the section name from before the Soop rebrand.
		for (nickname, ch) in file.soop.into_iter().chain(file.afreeca) {
			channels.push(channel_from_file(Platform::Soop, &nickname, ch)?);
		}

		let mut rewards = RewardRules::default();
		for (key, templates) in file.rewards {
			let amount = key
				.trim()
				.parse::<u64>()
				.map_err(|_| ConfigLoadError::RewardKey(key.clone()))?;
			rewards.insert(amount, templates.into_vec());
		}

		let defaults = RelaySettings::default();
		let settings = RelaySettings {
			random_reward: file.random_reward.unwrap_or(defaults.random_reward),
			auto_connect: file.auto_connect.unwrap_or(defaults.auto_connect),
			soop_balloon_amounts: file.soop_balloon_amounts.unwrap_or(defaults.soop_balloon_amounts),
		};

		let mut connection = ConnectionSettings::from_file(file.connection);
		let relay_command = non_empty(file.chat.relay_command);
		connection.session.chat_relay_command = relay_command.clone();

		let chzzk_default = ChzzkApiConfig::default();
		let runtime = RuntimeConfig {
			connection,
			chzzk_api: ChzzkApiConfig {
				api_base: non_empty(file.chzzk_api.api_base).unwrap_or(chzzk_default.api_base),
				game_base: non_empty(file.chzzk_api.game_base).unwrap_or(chzzk_default.game_base),
				chat_url: non_empty(file.chzzk_api.chat_url).unwrap_or(chzzk_default.chat_url),
			},
			soop_api: SoopApiConfig {
				live_api_base: non_empty(file.soop_api.live_api_base)
					.unwrap_or_else(|| SoopApiConfig::default().live_api_base),
			},
			chat: ChatSettings { relay_command },
			presence: file
				.presence
				.online
				.into_iter()
				.map(|t| t.trim().to_string())
				.filter(|t| !t.is_empty())
				.collect(),
			server: ServerSettings {
				metrics_bind: non_empty(file.server.metrics_bind),
			},
		};

		Ok(Self {
			channels,
			rewards,
			settings,
			runtime,
		})
	}
}

/// Parse and validate config text without env overrides.
pub fn parse_config(text: &str) -> Result<RelayConfig, ConfigLoadError> {
	let file: FileConfig = toml::from_str(text).map_err(|e| ConfigLoadError::Parse(e.to_string()))?;
	let cfg = RelayConfig::from_file(file)?;
	cfg.snapshot()?;
	Ok(cfg)
}

/// Read, validate and apply `DONERELAY_*` env overrides.
pub fn load_config_from_path(path: &Path) -> Result<RelayConfig, ConfigLoadError> {
	let text = fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
		path: path.display().to_string(),
		source,
	})?;
	let mut cfg = parse_config(&text)?;
	apply_env_overrides(&mut cfg);
	Ok(cfg)
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn apply_env_overrides(cfg: &mut RelayConfig) {
	apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides_from(cfg: &mut RelayConfig, var: impl Fn(&str) -> Option<String>) {
	if let Some(v) = var("DONERELAY_AUTO_CONNECT")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.settings.auto_connect = enabled;
		info!(enabled, "relay config: auto_connect overridden by env");
	}

	if let Some(v) = var("DONERELAY_RANDOM_REWARD")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.settings.random_reward = enabled;
		info!(enabled, "relay config: random_reward overridden by env");
	}

	if let Some(v) = var("DONERELAY_SOOP_BALLOON_AMOUNTS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.settings.soop_balloon_amounts = enabled;
		info!(enabled, "relay config: soop_balloon_amounts overridden by env");
	}

	if let Some(v) = var("DONERELAY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.runtime.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Some(v) = var("DONERELAY_SESSION_AUTO_RECONNECT")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.runtime.connection.session.auto_reconnect = enabled;
		info!(enabled, "connection config: session_auto_reconnect overridden by env");
	}

	if let Some(v) = var("DONERELAY_RECONNECT_MAX_ATTEMPTS")
		&& let Ok(attempts) = v.trim().parse::<u32>()
	{
		cfg.runtime.connection.session.reconnect.max_attempts = attempts;
		info!(attempts, "connection config: reconnect_max_attempts overridden by env");
	}

	if let Some(v) = var("DONERELAY_CHZZK_CHAT_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.runtime.chzzk_api.chat_url = v;
			info!("chzzk config: chat_url overridden by env");
		}
	}

	let reconnect = &mut cfg.runtime.connection.session.reconnect;
	if reconnect.initial_backoff > reconnect.max_backoff {
		warn!(
			initial_ms = reconnect.initial_backoff.as_millis(),
			max_ms = reconnect.max_backoff.as_millis(),
			"connection config: reconnect_initial_ms > reconnect_max_ms; swapping"
		);
		std::mem::swap(&mut reconnect.initial_backoff, &mut reconnect.max_backoff);
	}
}
