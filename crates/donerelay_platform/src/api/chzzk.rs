#![forbid(unsafe_code)]

use async_trait::async_trait;
use donerelay_domain::{ChannelIdentity, Platform};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{ConnectTarget, CredentialSource, http_client, http_error};
use crate::SecretString;
use crate::codec::ChannelCredentials;
use crate::error::SessionError;
use crate::transport::ConnectRequest;

pub const DEFAULT_API_BASE: &str = "https://api.chzzk.naver.com";
pub const DEFAULT_GAME_BASE: &str = "https://comm-api.game.naver.com";
pub const DEFAULT_CHAT_URL: &str = "wss://kr-ss1.chat.naver.com/chat";

#[derive(Debug, Clone)]
pub struct ChzzkApiConfig {
	pub api_base: String,
	pub game_base: String,
	pub chat_url: String,
}

impl Default for ChzzkApiConfig {
	fn default() -> Self {
		Self {
			api_base: DEFAULT_API_BASE.to_string(),
			game_base: DEFAULT_GAME_BASE.to_string(),
			chat_url: DEFAULT_CHAT_URL.to_string(),
		}
	}
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
	#[serde(default)]
	code: Option<i64>,
	#[serde(default)]
	message: Option<String>,
	content: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveStatus {
	chat_channel_id: Option<String>,
	#[serde(default)]
	status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessToken {
	access_token: String,
}

#[derive(Debug, Clone)]
pub struct ChzzkApi {
	cfg: ChzzkApiConfig,
	client: reqwest::Client,
}

impl ChzzkApi {
	pub fn new(cfg: ChzzkApiConfig) -> anyhow::Result<Self> {
		Ok(Self {
			cfg,
			client: http_client()?,
		})
	}

	async fn get_content<T: serde::de::DeserializeOwned>(&self, url: String, what: &str) -> Result<T, SessionError> {
		let resp = self.client.get(&url).send().await.map_err(|e| http_error(what, e))?;

		match resp.status() {
			StatusCode::OK => {}
			StatusCode::NOT_FOUND => return Err(SessionError::Unavailable(format!("{what}: not found"))),
			status => return Err(SessionError::Transport(format!("{what}: status={status}"))),
		}

		let env: Envelope<T> = resp.json().await.map_err(|e| http_error(what, e))?;
		env.content.ok_or_else(|| {
			SessionError::Unavailable(format!(
				"{what}: empty content (code={:?}, message={})",
				env.code,
				env.message.as_deref().unwrap_or("-")
			))
		})
	}

	/// Chat channel id of a live broadcast.
	pub async fn chat_channel_id(&self, channel_id: &str) -> Result<String, SessionError> {
		let url = format!(
			"{}/polling/v2/channels/{}/live-status",
			self.cfg.api_base.trim_end_matches('/'),
			urlencoding::encode(channel_id)
		);
		let status: LiveStatus = self.get_content(url, "chzzk live status").await?;
		debug!(channel_id, status = ?status.status, "chzzk live status");
		status
			.chat_channel_id
			.filter(|id| !id.trim().is_empty())
			.ok_or_else(|| SessionError::Unavailable(format!("chzzk channel {channel_id} is not live")))
	}

	pub async fn access_token(&self, chat_channel_id: &str) -> Result<SecretString, SessionError> {
		let url = format!(
			"{}/nng_main/v1/chats/access-token?channelId={}&chatType=STREAMING",
			self.cfg.game_base.trim_end_matches('/'),
			urlencoding::encode(chat_channel_id)
		);
		let token: AccessToken = self.get_content(url, "chzzk access token").await?;
		Ok(SecretString::new(token.access_token))
	}
}

pub(crate) fn chzzk_target(chat_url: &str, chat_channel_id: String, access_token: SecretString) -> ConnectTarget {
	ConnectTarget {
		request: ConnectRequest::new(chat_url),
		credentials: ChannelCredentials::Chzzk {
			chat_channel_id,
			access_token,
		},
	}
}

#[async_trait]
impl CredentialSource for ChzzkApi {
	async fn resolve(&self, identity: &ChannelIdentity) -> Result<ConnectTarget, SessionError> {
		if identity.platform != Platform::Chzzk {
			return Err(SessionError::Unavailable(format!("{identity} is not a chzzk channel")));
		}
		let chat_channel_id = self.chat_channel_id(&identity.external_id).await?;
		let access_token = self.access_token(&chat_channel_id).await?;
		Ok(chzzk_target(&self.cfg.chat_url, chat_channel_id, access_token))
	}
}
