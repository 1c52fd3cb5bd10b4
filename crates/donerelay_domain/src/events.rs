#![forbid(unsafe_code)]

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::Platform;

/// Display name used when a platform hides the sender.
pub const ANONYMOUS_DONOR: &str = "익명";

/// Chat sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
	#[default]
	Viewer,
	Manager,
	Streamer,
}

impl ChatRole {
	/// Map a Chzzk `userRoleCode`; unknown codes are viewers.
	pub fn from_role_code(code: &str) -> Self {
		match code {
			"streaming_chat_manager" => ChatRole::Manager,
			"streamer" => ChatRole::Streamer,
			_ => ChatRole::Viewer,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			ChatRole::Viewer => "viewer",
			ChatRole::Manager => "manager",
			ChatRole::Streamer => "streamer",
		}
	}
}

/// Nickname color as the host can render it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NickColor {
	Red,
	Blue,
	Green,
	#[default]
	White,
}

impl NickColor {
	/// Map a `#RRGGBB` code; anything unrecognised is white.
	pub fn from_hex(code: &str) -> Self {
		match code.trim().to_ascii_uppercase().as_str() {
			"#CC0000" => NickColor::Red,
			"#0000CC" => NickColor::Blue,
			"#00CC00" => NickColor::Green,
			_ => NickColor::White,
		}
	}
}

/// A monetary donation decoded from a platform frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonationEvent {
	pub platform: Platform,
	pub donor_name: String,
	/// Platform currency unit (won, or balloons when configured).
	pub amount: u64,
	pub message: String,
	pub received_at: SystemTime,
	/// Synthesised by an operator rather than received from a platform.
	pub is_test: bool,
}

impl DonationEvent {
	pub fn new(platform: Platform, donor_name: impl Into<String>, amount: u64, message: impl Into<String>) -> Self {
		Self {
			platform,
			donor_name: donor_name.into(),
			amount,
			message: message.into(),
			received_at: SystemTime::now(),
			is_test: false,
		}
	}

	pub fn test(platform: Platform, donor_name: impl Into<String>, amount: u64, message: impl Into<String>) -> Self {
		Self {
			is_test: true,
			..Self::new(platform, donor_name, amount, message)
		}
	}
}

/// A chat line decoded from a platform frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
	pub platform: Platform,
	pub sender_name: String,
	pub sender_id: Option<String>,
	pub role: ChatRole,
	pub color: NickColor,
	/// Text with emoji placeholders already substituted.
	pub text: String,
	/// Emoji keys that were substituted into `text`.
	pub emojis: Vec<String>,
	pub received_at: SystemTime,
}
