#![forbid(unsafe_code)]

mod events;
mod rewards;

use core::fmt;
use core::str::FromStr;
use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use events::{ANONYMOUS_DONOR, ChatEvent, ChatRole, DonationEvent, NickColor};
pub use rewards::{RewardRules, WILDCARD_AMOUNT};

/// Supported streaming platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
	Chzzk,
	Soop,
}

impl Platform {
	pub const ALL: [Platform; 2] = [Platform::Chzzk, Platform::Soop];

	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Platform::Chzzk => "chzzk",
			Platform::Soop => "soop",
		}
	}
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown platform: {0}")]
	UnknownPlatform(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for Platform {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"chzzk" | "치지직" => Ok(Platform::Chzzk),
			"soop" | "afreeca" | "afreecatv" | "숲" | "아프리카" => Ok(Platform::Soop),
			other => Err(ParseIdError::UnknownPlatform(other.to_string())),
		}
	}
}

/// One configured channel: which platform stream feeds which host-side identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIdentity {
	pub platform: Platform,
	/// Operator-facing channel name (the config key).
	pub nickname: String,
	/// Platform channel id (Chzzk channel hash, Soop BJ id).
	pub external_id: String,
	/// Host-side display identity rewards are credited to.
	pub tag: String,
	/// Remaining per-channel keys from the config file.
	#[serde(default)]
	pub raw: BTreeMap<String, String>,
}

impl ChannelIdentity {
	/// Create an identity; every field must be non-empty.
	pub fn new(
		platform: Platform,
		nickname: impl Into<String>,
		external_id: impl Into<String>,
		tag: impl Into<String>,
	) -> Result<Self, ParseIdError> {
		let nickname = nickname.into();
		let external_id = external_id.into();
		let tag = tag.into();
		if nickname.trim().is_empty() || external_id.trim().is_empty() || tag.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self {
			platform,
			nickname,
			external_id,
			tag,
			raw: BTreeMap::new(),
		})
	}

	pub fn with_raw(mut self, raw: BTreeMap<String, String>) -> Self {
		self.raw = raw;
		self
	}

	/// Same platform channel, regardless of nickname or tag.
	pub fn same_channel(&self, other: &ChannelIdentity) -> bool {
		self.platform == other.platform && self.external_id == other.external_id
	}

	/// Matches either the channel nickname or the display tag.
	pub fn matches(&self, target: &str) -> bool {
		let target = target.trim();
		self.nickname.eq_ignore_ascii_case(target) || self.tag.eq_ignore_ascii_case(target)
	}

	pub fn has_tag(&self, tag: &str) -> bool {
		self.tag.eq_ignore_ascii_case(tag.trim())
	}
}

impl fmt::Display for ChannelIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}({})", self.platform, self.nickname, self.tag)
	}
}

/// Global relay toggles that travel with the channel list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySettings {
	/// Pick one reward template at random instead of running all of them.
	pub random_reward: bool,
	/// Connect every channel on start and reload; otherwise only active tags.
	pub auto_connect: bool,
	/// Report Soop donations as balloon counts instead of won.
	pub soop_balloon_amounts: bool,
}

impl Default for RelaySettings {
	fn default() -> Self {
		Self {
			random_reward: false,
			auto_connect: true,
			soop_balloon_amounts: false,
		}
	}
}

/// Configuration load/validation failures.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
	#[error("failed to read config {path}: {source}")]
	Read {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse config: {0}")]
	Parse(String),
	#[error("{platform} channel `{nickname}` is missing `{field}`")]
	MissingField {
		platform: Platform,
		nickname: String,
		field: &'static str,
	},
	#[error("duplicate {platform} channel id `{external_id}`")]
	DuplicateChannel { platform: Platform, external_id: String },
	#[error("no channels configured")]
	NoChannels,
	#[error("reward key `{0}` is not a non-negative integer")]
	RewardKey(String),
	#[error("no reward rules configured")]
	NoRewards,
}

/// Channels, rewards and toggles as one consistent unit; swapped wholesale on reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelaySnapshot {
	channels: Vec<ChannelIdentity>,
	rewards: RewardRules,
	settings: RelaySettings,
}

impl RelaySnapshot {
	/// Build a validated snapshot.
	pub fn new(
		channels: Vec<ChannelIdentity>,
		rewards: RewardRules,
		settings: RelaySettings,
	) -> Result<Self, ConfigLoadError> {
		if channels.is_empty() {
			return Err(ConfigLoadError::NoChannels);
		}
		if rewards.is_empty() {
			return Err(ConfigLoadError::NoRewards);
		}

		let mut seen = HashSet::new();
		for channel in &channels {
			if !seen.insert((channel.platform, channel.external_id.as_str())) {
				return Err(ConfigLoadError::DuplicateChannel {
					platform: channel.platform,
					external_id: channel.external_id.clone(),
				});
			}
		}

		Ok(Self {
			channels,
			rewards,
			settings,
		})
	}

	pub fn channels(&self) -> &[ChannelIdentity] {
		&self.channels
	}

	pub fn channels_for(&self, platform: Platform) -> impl Iterator<Item = &ChannelIdentity> {
		self.channels.iter().filter(move |c| c.platform == platform)
	}

	/// Channels on `platform` whose nickname or tag equals `target`.
	pub fn find(&self, platform: Platform, target: &str) -> Vec<ChannelIdentity> {
		self.channels_for(platform).filter(|c| c.matches(target)).cloned().collect()
	}

	pub fn rewards(&self) -> &RewardRules {
		&self.rewards
	}

	pub fn settings(&self) -> RelaySettings {
		self.settings
	}

	/// Copy with one more channel; a channel that is already present is not duplicated.
	pub fn with_channel(&self, identity: ChannelIdentity) -> Self {
		let mut next = self.clone();
		if !next.channels.iter().any(|c| c.same_channel(&identity)) {
			next.channels.push(identity);
		}
		next
	}

	/// Copy with different toggles.
	pub fn with_settings(&self, settings: RelaySettings) -> Self {
		let mut next = self.clone();
		next.settings = settings;
		next
	}
}
