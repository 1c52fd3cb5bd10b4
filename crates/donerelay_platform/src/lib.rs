#![forbid(unsafe_code)]

pub mod api;
pub mod codec;
pub mod driver;
pub mod error;
pub mod reconnect;
pub mod reward;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod transport;

#[cfg(test)]
mod test_support;

use std::fmt;

use async_trait::async_trait;
use donerelay_domain::{ChannelIdentity, ChatEvent, DonationEvent};
use uuid::Uuid;

pub use driver::{DriverFactory, LiveDrivers, PlatformDriver};
pub use error::{CommandError, ProtocolDecodeError, SessionError};
pub use reconnect::ReconnectPolicy;
pub use reward::{DispatchReport, RewardDispatcher};
pub use scheduler::Scheduler;
pub use session::{ConnectionSession, SessionContext, SessionSettings, SessionState, SessionStats};
pub use snapshot::SnapshotHandle;

/// Runs command strings on the host's designated execution context.
#[async_trait]
pub trait CommandExecutor: Send + Sync + 'static {
	/// Resolves to whether the host accepted the command.
	async fn submit(&self, command: String) -> anyhow::Result<bool>;
}

/// Host-side knowledge about display tags.
pub trait PresenceResolver: Send + Sync + 'static {
	/// Tag is online or otherwise deliverable.
	fn is_known(&self, tag: &str) -> bool;

	/// Tags currently active on the host.
	fn active_tags(&self) -> Vec<String>;
}

/// Receives decoded events for delivery and persistence.
pub trait EventSink: Send + Sync + 'static {
	fn on_donation(&self, channel: &ChannelIdentity, event: &DonationEvent);

	fn on_chat(&self, channel: &ChannelIdentity, event: &ChatEvent);
}

/// Whether relay features are licensed on this host.
pub trait FeatureGate: Send + Sync + 'static {
	fn features_enabled(&self) -> bool;
}

/// Gate that never blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysEnabled;

impl FeatureGate for AlwaysEnabled {
	fn features_enabled(&self) -> bool {
		true
	}
}

/// Generate a new session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}
