#![forbid(unsafe_code)]

//! HTTP lookups that turn a configured channel into a connectable chat target.

pub mod chzzk;
pub mod soop;

use async_trait::async_trait;
use donerelay_domain::ChannelIdentity;

use crate::codec::ChannelCredentials;
use crate::error::SessionError;
use crate::transport::ConnectRequest;

pub use chzzk::{ChzzkApi, ChzzkApiConfig};
pub use soop::{SoopApi, SoopApiConfig};

const USER_AGENT: &str = concat!("donerelay/", env!("CARGO_PKG_VERSION"));

/// Everything needed to open and authenticate one chat socket.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
	pub request: ConnectRequest,
	pub credentials: ChannelCredentials,
}

/// Resolves live chat endpoints and credentials for a channel.
#[async_trait]
pub trait CredentialSource: Send + Sync + 'static {
	/// `SessionError::Unavailable` when the channel is not live.
	async fn resolve(&self, identity: &ChannelIdentity) -> Result<ConnectTarget, SessionError>;
}

fn http_client() -> anyhow::Result<reqwest::Client> {
	use anyhow::Context as _;

	reqwest::Client::builder()
		.user_agent(USER_AGENT)
		.timeout(std::time::Duration::from_secs(5))
		.build()
		.context("build http client")
}

fn http_error(what: &str, e: reqwest::Error) -> SessionError {
	SessionError::Transport(format!("{what}: {e}"))
}
