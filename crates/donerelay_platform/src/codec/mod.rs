#![forbid(unsafe_code)]

//! Wire codecs: raw websocket messages <-> normalized frames.
//!
//! Codecs are stateless; anything that varies per connection travels in
//! [`ChannelCredentials`].

pub mod chzzk;
pub mod soop;

use donerelay_domain::{ChatEvent, DonationEvent, Platform};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::SecretString;
use crate::error::{ProtocolDecodeError, SessionError};

pub use chzzk::ChzzkCodec;
pub use soop::SoopCodec;

/// Result of the platform's authentication handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
	Accepted,
	Rejected(String),
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
	/// Server keepalive probe; must be answered with a heartbeat ack.
	Heartbeat,
	/// Server answer to our own keepalive.
	HeartbeatAck,
	AuthAck(AuthOutcome),
	Chat(ChatEvent),
	Donation(DonationEvent),
	/// Command code this client does not handle.
	Unknown(String),
}

/// Per-connection values a codec needs to build handshake frames.
#[derive(Debug, Clone)]
pub enum ChannelCredentials {
	Chzzk {
		chat_channel_id: String,
		access_token: SecretString,
	},
	Soop {
		bj_id: String,
		chat_no: String,
	},
}

impl ChannelCredentials {
	pub fn platform(&self) -> Platform {
		match self {
			Self::Chzzk { .. } => Platform::Chzzk,
			Self::Soop { .. } => Platform::Soop,
		}
	}
}

/// Encode/decode boundary for one platform.
pub trait FrameCodec: Send + Sync + 'static {
	fn platform(&self) -> Platform;

	/// `Ok(None)` means the frame is valid but carries nothing to act on.
	fn decode(&self, raw: &Message) -> Result<Option<Frame>, ProtocolDecodeError>;

	fn encode_auth(&self, credentials: &ChannelCredentials) -> Result<Message, SessionError>;

	/// Follow-up frame once the server accepted authentication.
	fn encode_after_auth(&self, _credentials: &ChannelCredentials) -> Option<Message> {
		None
	}

	/// Periodic client keepalive.
	fn encode_heartbeat(&self) -> Message;

	fn encode_heartbeat_ack(&self) -> Message {
		self.encode_heartbeat()
	}
}

/// Textual payload of a data message; control messages yield `None`.
pub(crate) fn message_text(raw: &Message) -> Result<Option<&str>, ProtocolDecodeError> {
	match raw {
		Message::Text(t) => Ok(Some(t.as_str())),
		Message::Binary(b) => std::str::from_utf8(b)
			.map(Some)
			.map_err(|e| ProtocolDecodeError::Malformed(format!("frame is not utf-8: {e}"))),
		_ => Ok(None),
	}
}

fn credentials_mismatch(expected: Platform, got: &ChannelCredentials) -> SessionError {
	SessionError::Auth(format!(
		"{expected} codec cannot authenticate with {} credentials",
		got.platform()
	))
}
