#![forbid(unsafe_code)]

use async_trait::async_trait;
use donerelay_domain::{ChannelIdentity, Platform};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use super::{ConnectTarget, CredentialSource, http_client, http_error};
use crate::codec::ChannelCredentials;
use crate::error::SessionError;
use crate::transport::ConnectRequest;

pub const DEFAULT_LIVE_API_BASE: &str = "https://live.sooplive.co.kr";
pub const CHAT_SUBPROTOCOL: &str = "chat";

#[derive(Debug, Clone)]
pub struct SoopApiConfig {
	pub live_api_base: String,
}

impl Default for SoopApiConfig {
	fn default() -> Self {
		Self {
			live_api_base: DEFAULT_LIVE_API_BASE.to_string(),
		}
	}
}

#[derive(Debug, Deserialize)]
struct LiveResponse {
	#[serde(rename = "CHANNEL")]
	channel: LiveChannel,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
struct LiveChannel {
	result: Value,
	#[serde(default)]
	bjid: Option<String>,
	#[serde(default)]
	chdomain: Option<String>,
	#[serde(default)]
	chatno: Option<Value>,
	#[serde(default)]
	chpt: Option<Value>,
}

fn scalar_text(v: &Value) -> Option<String> {
	match v {
		Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
		Value::Number(n) => Some(n.to_string()),
		_ => None,
	}
}

fn live_target(bj_id: &str, channel: LiveChannel) -> Result<ConnectTarget, SessionError> {
	if scalar_text(&channel.result).as_deref() != Some("1") {
		return Err(SessionError::Unavailable(format!("soop channel {bj_id} is not live")));
	}

	let missing = |field: &str| SessionError::Unavailable(format!("soop live info for {bj_id} lacks {field}"));
	let domain = channel
		.chdomain
		.filter(|d| !d.trim().is_empty())
		.ok_or_else(|| missing("CHDOMAIN"))?;
	let chat_no = channel.chatno.as_ref().and_then(scalar_text).ok_or_else(|| missing("CHATNO"))?;
	let port: u16 = channel
		.chpt
		.as_ref()
		.and_then(scalar_text)
		.and_then(|p| p.parse().ok())
		.ok_or_else(|| missing("CHPT"))?;
	let bj = channel.bjid.unwrap_or_else(|| bj_id.to_string());

	// The advertised port is the plain socket; TLS listens one above it.
	let url = format!(
		"wss://{}:{}/Websocket/{}",
		domain.trim().to_ascii_lowercase(),
		port.saturating_add(1),
		bj
	);

	Ok(ConnectTarget {
		request: ConnectRequest::new(url).with_subprotocol(CHAT_SUBPROTOCOL),
		credentials: ChannelCredentials::Soop { bj_id: bj, chat_no },
	})
}

#[derive(Debug, Clone)]
pub struct SoopApi {
	cfg: SoopApiConfig,
	client: reqwest::Client,
}

impl SoopApi {
	pub fn new(cfg: SoopApiConfig) -> anyhow::Result<Self> {
		Ok(Self {
			cfg,
			client: http_client()?,
		})
	}
}

#[async_trait]
impl CredentialSource for SoopApi {
	async fn resolve(&self, identity: &ChannelIdentity) -> Result<ConnectTarget, SessionError> {
		if identity.platform != Platform::Soop {
			return Err(SessionError::Unavailable(format!("{identity} is not a soop channel")));
		}
		let bj_id = identity.external_id.as_str();
		let url = format!(
			"{}/afreeca/player_live_api.php?bjid={}",
			self.cfg.live_api_base.trim_end_matches('/'),
			urlencoding::encode(bj_id)
		);
		let form = [
			("bid", bj_id),
			("type", "live"),
			("player_type", "html5"),
			("stream_type", "common"),
			("quality", "HD"),
			("mode", "landing"),
			("from_api", "0"),
		];

		let resp = self
			.client
			.post(url)
			.form(&form)
			.send()
			.await
			.map_err(|e| http_error("soop live info", e))?;
		if resp.status() != StatusCode::OK {
			return Err(SessionError::Transport(format!("soop live info: status={}", resp.status())));
		}

		let live: LiveResponse = resp.json().await.map_err(|e| http_error("soop live info", e))?;
		live_target(bj_id, live.channel)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(json: &str) -> LiveChannel {
		serde_json::from_str::<LiveResponse>(json).expect("parse").channel
	}

	#[test]
	fn live_channel_builds_tls_endpoint() {
		let channel = parse(
			r#"{"CHANNEL":{"RESULT":1,"BJID":"streamer","CHDOMAIN":"CHAT-01.SOOPLIVE.CO.KR","CHATNO":"12345","CHPT":"8001","FTK":"x"}}"#,
		);
		let target = live_target("streamer", channel).expect("target");
		assert_eq!(target.request.url, "wss://chat-01.sooplive.co.kr:8002/Websocket/streamer");
		assert_eq!(target.request.subprotocol.as_deref(), Some(CHAT_SUBPROTOCOL));
		assert!(matches!(
			target.credentials,
			ChannelCredentials::Soop { ref chat_no, .. } if chat_no == "12345"
		));
	}

	#[test]
	fn numeric_fields_are_accepted() {
		let channel = parse(r#"{"CHANNEL":{"RESULT":"1","CHDOMAIN":"chat","CHATNO":777,"CHPT":9000}}"#);
		let target = live_target("bj", channel).expect("target");
		assert_eq!(target.request.url, "wss://chat:9001/Websocket/bj");
	}

	#[test]
	fn offline_channel_is_unavailable() {
		let channel = parse(r#"{"CHANNEL":{"RESULT":0}}"#);
		assert!(matches!(live_target("bj", channel), Err(SessionError::Unavailable(_))));
	}

	#[test]
	fn missing_port_is_unavailable() {
		let channel = parse(r#"{"CHANNEL":{"RESULT":1,"CHDOMAIN":"chat","CHATNO":"1"}}"#);
		assert!(matches!(live_target("bj", channel), Err(SessionError::Unavailable(_))));
	}
}
