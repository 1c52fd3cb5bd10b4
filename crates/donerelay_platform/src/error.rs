#![forbid(unsafe_code)]

use std::time::Duration;

use thiserror::Error;

/// Malformed or unexpected inbound frame. Never fatal; the frame is dropped.
#[derive(Debug, Error)]
pub enum ProtocolDecodeError {
	#[error("invalid json: {0}")]
	Json(#[from] serde_json::Error),
	#[error("malformed frame: {0}")]
	Malformed(String),
	#[error("unexpected shape for `{field}`")]
	Shape { field: &'static str },
	#[error("invalid amount `{0}`")]
	Amount(String),
}

/// Session-level failures. Recovered locally through the reconnect path.
#[derive(Debug, Error)]
pub enum SessionError {
	#[error("transport error: {0}")]
	Transport(String),
	#[error(transparent)]
	Decode(#[from] ProtocolDecodeError),
	#[error("authentication rejected: {0}")]
	Auth(String),
	#[error("channel unavailable: {0}")]
	Unavailable(String),
	#[error("timed out after {0:?}")]
	Timeout(Duration),
	/// The identity already has a live session; callers treat this as success.
	#[error("channel already connected")]
	DuplicateConnection,
	#[error("session is not connected")]
	NotConnected,
	#[error("session is shutting down")]
	ShuttingDown,
}

impl SessionError {
	pub fn transport(e: impl std::fmt::Display) -> Self {
		Self::Transport(e.to_string())
	}

	/// Outcome that still leaves the channel connected.
	pub fn is_duplicate(&self) -> bool {
		matches!(self, Self::DuplicateConnection)
	}
}

/// Per-command failures. Logged and skipped; the remaining commands still run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
	#[error("command timed out after {timeout:?}: {command}")]
	Timeout { timeout: Duration, command: String },
	#[error("command rejected by host: {0}")]
	Rejected(String),
	#[error("command submission failed: {0}")]
	Failed(String),
	#[error("command cancelled")]
	Cancelled,
}
