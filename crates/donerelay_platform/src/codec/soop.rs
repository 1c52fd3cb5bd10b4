#![forbid(unsafe_code)]

//! Soop chat packets.
//!
//! Layout: `ESC TAB` + 4-digit service code + 6-digit body length + `00` + body,
//! body fields separated by form feed.

use std::time::SystemTime;

use donerelay_domain::{ChatEvent, ChatRole, DonationEvent, NickColor, Platform};
use tokio_tungstenite::tungstenite::protocol::Message;

use super::{AuthOutcome, ChannelCredentials, Frame, FrameCodec, credentials_mismatch, message_text};
use crate::error::{ProtocolDecodeError, SessionError};

pub const PACKET_PREFIX: &str = "\x1b\t";
pub const FIELD_SEPARATOR: char = '\x0c';

pub const SVC_PING: &str = "0000";
pub const SVC_LOGIN: &str = "0001";
pub const SVC_JOIN: &str = "0002";
pub const SVC_CHAT: &str = "0005";
pub const SVC_BALLOON: &str = "0018";

/// Won per balloon.
const BALLOON_WON: u64 = 100;

/// One decoded packet: service code plus body fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoopPacket {
	pub service: String,
	pub fields: Vec<String>,
}

impl SoopPacket {
	pub fn parse(raw: &str) -> Result<Self, ProtocolDecodeError> {
		let rest = raw
			.strip_prefix(PACKET_PREFIX)
			.ok_or_else(|| ProtocolDecodeError::Malformed("missing packet prefix".to_string()))?;

		let mut parts = rest.split(FIELD_SEPARATOR);
		let header = parts.next().unwrap_or_default();
		let service = header
			.get(..4)
			.filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
			.ok_or_else(|| ProtocolDecodeError::Malformed(format!("bad packet header `{header}`")))?;

		Ok(Self {
			service: service.to_string(),
			fields: parts.map(str::to_string).collect(),
		})
	}

	fn field(&self, idx: usize) -> Option<&str> {
		self.fields.get(idx).map(String::as_str)
	}
}

/// Build a packet around `body`.
pub fn encode_packet(service: &str, body: &str) -> String {
	format!("{PACKET_PREFIX}{service}{:06}00{body}", body.len())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SoopCodec {
	/// Report balloon counts as-is instead of converting to won.
	pub balloon_amounts: bool,
}

impl SoopCodec {
	pub fn new(balloon_amounts: bool) -> Self {
		Self { balloon_amounts }
	}

	fn decode_packet(&self, packet: SoopPacket) -> Result<Option<Frame>, ProtocolDecodeError> {
		match packet.service.as_str() {
			SVC_PING => Ok(Some(Frame::HeartbeatAck)),
			SVC_LOGIN => Ok(Some(Frame::AuthAck(login_outcome(&packet)))),
			SVC_CHAT => Ok(decode_chat(&packet)),
			SVC_BALLOON => self.decode_balloon(&packet),
			other => Ok(Some(Frame::Unknown(other.to_string()))),
		}
	}

	fn decode_balloon(&self, packet: &SoopPacket) -> Result<Option<Frame>, ProtocolDecodeError> {
		let Some(count) = packet.field(3).map(str::trim).filter(|c| !c.is_empty()) else {
			return Ok(None);
		};
		let count: u64 = count
			.parse()
			.map_err(|_| ProtocolDecodeError::Amount(count.to_string()))?;
		let amount = if self.balloon_amounts {
			count
		} else {
			count.saturating_mul(BALLOON_WON)
		};

		let donor = packet.field(2).unwrap_or_default();
		Ok(Some(Frame::Donation(DonationEvent::new(Platform::Soop, donor, amount, ""))))
	}
}

fn login_outcome(packet: &SoopPacket) -> AuthOutcome {
	if packet.fields.iter().any(|f| !f.is_empty()) {
		AuthOutcome::Accepted
	} else {
		AuthOutcome::Rejected("empty login response".to_string())
	}
}

fn decode_chat(packet: &SoopPacket) -> Option<Frame> {
	let text = packet.field(0)?;
	if text.trim().is_empty() || text == "-1" || text == "1" {
		return None;
	}
	let nickname = packet.field(5)?;

	Some(Frame::Chat(ChatEvent {
		platform: Platform::Soop,
		sender_name: nickname.to_string(),
		sender_id: packet.field(1).filter(|id| !id.is_empty()).map(str::to_string),
		role: ChatRole::Viewer,
		color: NickColor::White,
		text: text.to_string(),
		emojis: Vec::new(),
		received_at: SystemTime::now(),
	}))
}

impl FrameCodec for SoopCodec {
	fn platform(&self) -> Platform {
		Platform::Soop
	}

	fn decode(&self, raw: &Message) -> Result<Option<Frame>, ProtocolDecodeError> {
		let Some(text) = message_text(raw)? else {
			return Ok(None);
		};
		self.decode_packet(SoopPacket::parse(text)?)
	}

	fn encode_auth(&self, credentials: &ChannelCredentials) -> Result<Message, SessionError> {
		if !matches!(credentials, ChannelCredentials::Soop { .. }) {
			return Err(credentials_mismatch(Platform::Soop, credentials));
		}
		let f = FIELD_SEPARATOR;
		Ok(Message::binary(
			encode_packet(SVC_LOGIN, &format!("{f}{f}{f}16{f}")).into_bytes(),
		))
	}

	fn encode_after_auth(&self, credentials: &ChannelCredentials) -> Option<Message> {
		let ChannelCredentials::Soop { chat_no, .. } = credentials else {
			return None;
		};
		let f = FIELD_SEPARATOR;
		let padding = f.to_string().repeat(5);
		Some(Message::binary(
			encode_packet(SVC_JOIN, &format!("{f}{chat_no}{padding}")).into_bytes(),
		))
	}

	fn encode_heartbeat(&self) -> Message {
		Message::binary(encode_packet(SVC_PING, &FIELD_SEPARATOR.to_string()).into_bytes())
	}
}
