#![forbid(unsafe_code)]

//! Chzzk chat frames: JSON objects tagged by an integer `cmd`.

use std::time::SystemTime;

use donerelay_domain::{ANONYMOUS_DONOR, ChatEvent, ChatRole, DonationEvent, NickColor, Platform};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite::protocol::Message;

use super::{AuthOutcome, ChannelCredentials, Frame, FrameCodec, credentials_mismatch, message_text};
use crate::error::{ProtocolDecodeError, SessionError};

pub const CMD_PING: i64 = 0;
pub const CMD_PONG: i64 = 10000;
pub const CMD_CONNECT: i64 = 100;
pub const CMD_CONNECT_RES: i64 = 10100;
pub const CMD_CHAT: i64 = 93101;
pub const CMD_DONATION: i64 = 93102;

/// Web client device type.
const DEV_TYPE: u32 = 2001;
const ANONYMOUS_UID: &str = "anonymous";
const PONG_FRAME: &str = r#"{"cmd":10000,"ver":"2"}"#;

#[derive(Debug, Serialize)]
struct AuthFrame<'a> {
	ver: &'static str,
	svcid: &'static str,
	cid: &'a str,
	cmd: i64,
	tid: u32,
	bdy: AuthBody<'a>,
}

#[derive(Debug, Serialize)]
struct AuthBody<'a> {
	uid: Option<&'a str>,
	#[serde(rename = "devType")]
	dev_type: u32,
	#[serde(rename = "accTkn")]
	access_token: &'a str,
	auth: &'static str,
}

#[derive(Debug, Deserialize)]
struct Envelope {
	cmd: Value,
	#[serde(default)]
	bdy: Value,
	#[serde(default, rename = "retCode")]
	ret_code: Option<i64>,
	#[serde(default, rename = "retMsg")]
	ret_msg: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChzzkCodec;

impl FrameCodec for ChzzkCodec {
	fn platform(&self) -> Platform {
		Platform::Chzzk
	}

	fn decode(&self, raw: &Message) -> Result<Option<Frame>, ProtocolDecodeError> {
		let Some(text) = message_text(raw)? else {
			return Ok(None);
		};
		decode_text(text)
	}

	fn encode_auth(&self, credentials: &ChannelCredentials) -> Result<Message, SessionError> {
		let ChannelCredentials::Chzzk {
			chat_channel_id,
			access_token,
		} = credentials
		else {
			return Err(credentials_mismatch(Platform::Chzzk, credentials));
		};

		let frame = AuthFrame {
			ver: "2",
			svcid: "game",
			cid: chat_channel_id,
			cmd: CMD_CONNECT,
			tid: 1,
			bdy: AuthBody {
				uid: None,
				dev_type: DEV_TYPE,
				access_token: access_token.expose(),
				auth: "READ",
			},
		};
		let json = serde_json::to_string(&frame).map_err(ProtocolDecodeError::from)?;
		Ok(Message::text(json))
	}

	fn encode_heartbeat(&self) -> Message {
		Message::text(PONG_FRAME)
	}
}

fn decode_text(text: &str) -> Result<Option<Frame>, ProtocolDecodeError> {
	let env: Envelope = serde_json::from_str(text)?;

	match command_code(&env.cmd)? {
		CMD_PING => Ok(Some(Frame::Heartbeat)),
		CMD_PONG => Ok(Some(Frame::HeartbeatAck)),
		CMD_CONNECT_RES => Ok(Some(Frame::AuthAck(auth_outcome(&env)))),
		CMD_CHAT => decode_chat(&env.bdy),
		CMD_DONATION => decode_donation(&env.bdy),
		other => Ok(Some(Frame::Unknown(other.to_string()))),
	}
}

fn command_code(cmd: &Value) -> Result<i64, ProtocolDecodeError> {
	match cmd {
		Value::Number(n) => n.as_i64().ok_or(ProtocolDecodeError::Shape { field: "cmd" }),
		Value::String(s) => s
			.trim()
			.parse::<i64>()
			.map_err(|_| ProtocolDecodeError::Shape { field: "cmd" }),
		_ => Err(ProtocolDecodeError::Shape { field: "cmd" }),
	}
}

fn auth_outcome(env: &Envelope) -> AuthOutcome {
	match env.ret_code {
		None | Some(0) => AuthOutcome::Accepted,
		Some(code) => AuthOutcome::Rejected(format!(
			"retCode {code}: {}",
			env.ret_msg.as_deref().unwrap_or("no message")
		)),
	}
}

/// `bdy` is normally an array of messages; only the first one is used.
fn first_message(bdy: &Value) -> Result<Option<&Map<String, Value>>, ProtocolDecodeError> {
	match bdy {
		Value::Array(items) => match items.first() {
			None => Ok(None),
			Some(Value::Object(map)) => Ok(Some(map)),
			Some(_) => Err(ProtocolDecodeError::Shape { field: "bdy" }),
		},
		Value::Object(map) => Ok(Some(map)),
		Value::Null => Ok(None),
		_ => Err(ProtocolDecodeError::Shape { field: "bdy" }),
	}
}

/// Nested objects arrive either as embedded JSON text or inline.
fn embedded_object(
	value: Option<&Value>,
	field: &'static str,
) -> Result<Option<Map<String, Value>>, ProtocolDecodeError> {
	match value {
		None | Some(Value::Null) => Ok(None),
		Some(Value::Object(map)) => Ok(Some(map.clone())),
		Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
		Some(Value::String(text)) => match serde_json::from_str::<Value>(text)? {
			Value::Object(map) => Ok(Some(map)),
			Value::Null => Ok(None),
			_ => Err(ProtocolDecodeError::Shape { field }),
		},
		Some(_) => Err(ProtocolDecodeError::Shape { field }),
	}
}

fn str_field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
	map.get(key).and_then(Value::as_str)
}

fn sender_name(item: &Map<String, Value>) -> Result<(String, Option<Map<String, Value>>), ProtocolDecodeError> {
	if str_field(item, "uid") == Some(ANONYMOUS_UID) {
		return Ok((ANONYMOUS_DONOR.to_string(), None));
	}
	let profile = embedded_object(item.get("profile"), "profile")?;
	let name = profile
		.as_ref()
		.and_then(|p| str_field(p, "nickname"))
		.filter(|n| !n.trim().is_empty())
		.unwrap_or(ANONYMOUS_DONOR)
		.to_string();
	Ok((name, profile))
}

fn nickname_color(profile: &Map<String, Value>) -> Result<NickColor, ProtocolDecodeError> {
	let Some(streaming) = embedded_object(profile.get("streamingProperty"), "streamingProperty")? else {
		return Ok(NickColor::default());
	};
	let Some(nickname_color) = embedded_object(streaming.get("nicknameColor"), "nicknameColor")? else {
		return Ok(NickColor::default());
	};
	Ok(str_field(&nickname_color, "colorCode")
		.map(|code| NickColor::from_hex(&format!("#{}", code.trim().trim_start_matches('#'))))
		.unwrap_or_default())
}

/// Replaces `{:key:}` with `:key:` for every emoji the frame declares.
fn substitute_emojis(text: &str, extras: Option<&Map<String, Value>>) -> (String, Vec<String>) {
	let mut out = text.to_string();
	let mut used = Vec::new();

	if let Some(Value::Object(emojis)) = extras.and_then(|e| e.get("emojis")) {
		for key in emojis.keys() {
			let placeholder = format!("{{:{key}:}}");
			if out.contains(&placeholder) {
				out = out.replace(&placeholder, &format!(":{key}:"));
				used.push(key.clone());
			}
		}
	}

	(out, used)
}

fn decode_chat(bdy: &Value) -> Result<Option<Frame>, ProtocolDecodeError> {
	let Some(item) = first_message(bdy)? else {
		return Ok(None);
	};

	let raw_text = str_field(item, "msg")
		.or_else(|| str_field(item, "content"))
		.unwrap_or_default();
	if raw_text.trim().is_empty() {
		return Ok(None);
	}

	let (sender_name, profile) = sender_name(item)?;
	let (role, color) = match &profile {
		Some(profile) => (
			str_field(profile, "userRoleCode")
				.map(ChatRole::from_role_code)
				.unwrap_or_default(),
			nickname_color(profile)?,
		),
		None => (ChatRole::default(), NickColor::default()),
	};

	let extras = embedded_object(item.get("extras"), "extras")?;
	let (text, emojis) = substitute_emojis(raw_text, extras.as_ref());

	Ok(Some(Frame::Chat(ChatEvent {
		platform: Platform::Chzzk,
		sender_name,
		sender_id: str_field(item, "uid")
			.filter(|uid| *uid != ANONYMOUS_UID)
			.map(str::to_string),
		role,
		color,
		text,
		emojis,
		received_at: SystemTime::now(),
	})))
}

fn parse_amount(value: &Value) -> Result<u64, ProtocolDecodeError> {
	match value {
		Value::Number(n) => n.as_u64().ok_or_else(|| ProtocolDecodeError::Amount(n.to_string())),
		Value::String(s) => s
			.trim()
			.parse::<u64>()
			.map_err(|_| ProtocolDecodeError::Amount(s.clone())),
		other => Err(ProtocolDecodeError::Amount(other.to_string())),
	}
}

fn decode_donation(bdy: &Value) -> Result<Option<Frame>, ProtocolDecodeError> {
	let Some(item) = first_message(bdy)? else {
		return Ok(None);
	};

	let Some(extras) = embedded_object(item.get("extras"), "extras")? else {
		return Ok(None);
	};
	let Some(pay_amount) = extras.get("payAmount").filter(|v| !v.is_null()) else {
		return Ok(None);
	};
	let amount = parse_amount(pay_amount)?;

	let (donor, _) = sender_name(item)?;
	let message = str_field(item, "msg").unwrap_or_default();

	Ok(Some(Frame::Donation(DonationEvent::new(
		Platform::Chzzk,
		donor,
		amount,
		message,
	))))
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::SecretString;

	fn decode(v: Value) -> Result<Option<Frame>, ProtocolDecodeError> {
		ChzzkCodec.decode(&Message::text(v.to_string()))
	}

	fn donation(frame: Option<Frame>) -> DonationEvent {
		match frame {
			Some(Frame::Donation(ev)) => ev,
			other => panic!("expected donation, got {other:?}"),
		}
	}

	fn chat(frame: Option<Frame>) -> ChatEvent {
		match frame {
			Some(Frame::Chat(ev)) => ev,
			other => panic!("expected chat, got {other:?}"),
		}
	}

	#[test]
	fn auth_frame_is_bit_exact() {
		let creds = ChannelCredentials::Chzzk {
			chat_channel_id: "N1abc".to_string(),
			access_token: SecretString::new("tok"),
		};
		let msg = ChzzkCodec.encode_auth(&creds).expect("encode");
		assert_eq!(
			msg.to_text().expect("text"),
			r#"{"ver":"2","svcid":"game","cid":"N1abc","cmd":100,"tid":1,"bdy":{"uid":null,"devType":2001,"accTkn":"tok","auth":"READ"}}"#
		);
	}

	#[test]
	fn auth_rejects_foreign_credentials() {
		let creds = ChannelCredentials::Soop {
			bj_id: "bj".to_string(),
			chat_no: "1".to_string(),
		};
		assert!(matches!(ChzzkCodec.encode_auth(&creds), Err(SessionError::Auth(_))));
	}

	#[test]
	fn heartbeat_frames() {
		assert_eq!(ChzzkCodec.encode_heartbeat_ack().to_text().expect("text"), PONG_FRAME);
		assert_eq!(decode(json!({"cmd": 0, "ver": "2"})).expect("decode"), Some(Frame::Heartbeat));
		assert_eq!(decode(json!({"cmd": 10000})).expect("decode"), Some(Frame::HeartbeatAck));
	}

	#[test]
	fn connect_response_maps_ret_code() {
		assert_eq!(
			decode(json!({"cmd": 10100, "retCode": 0, "bdy": {"sid": "x"}})).expect("decode"),
			Some(Frame::AuthAck(AuthOutcome::Accepted))
		);
		let rejected = decode(json!({"cmd": 10100, "retCode": 42, "retMsg": "bad token"})).expect("decode");
		assert!(matches!(rejected, Some(Frame::AuthAck(AuthOutcome::Rejected(reason))) if reason.contains("bad token")));
	}

	#[test]
	fn unknown_codes_are_not_errors() {
		assert_eq!(
			decode(json!({"cmd": 94008, "bdy": {}})).expect("decode"),
			Some(Frame::Unknown("94008".to_string()))
		);
	}

	#[test]
	fn string_command_codes_are_accepted() {
		let frame = decode(json!({
			"cmd": "93102",
			"bdy": [{"uid": "anonymous", "msg": "hi", "extras": "{\"payAmount\":1000}"}]
		}))
		.expect("decode");
		assert_eq!(donation(frame).amount, 1000);
	}

	#[test]
	fn donation_with_embedded_json_text() {
		let frame = decode(json!({
			"cmd": 93102,
			"bdy": [{
				"uid": "u1",
				"msg": "cheer up",
				"profile": "{\"nickname\":\"Carol\"}",
				"extras": "{\"payAmount\":5000,\"payType\":\"CURRENCY\"}"
			}]
		}))
		.expect("decode");
		let ev = donation(frame);
		assert_eq!(ev.donor_name, "Carol");
		assert_eq!(ev.amount, 5000);
		assert_eq!(ev.message, "cheer up");
		assert_eq!(ev.platform, Platform::Chzzk);
	}

	#[test]
	fn donation_with_nested_objects() {
		let frame = decode(json!({
			"cmd": 93102,
			"bdy": [{
				"uid": "u1",
				"profile": {"nickname": "Dave"},
				"extras": {"payAmount": "1000"}
			}]
		}))
		.expect("decode");
		let ev = donation(frame);
		assert_eq!(ev.donor_name, "Dave");
		assert_eq!(ev.amount, 1000);
		assert_eq!(ev.message, "");
	}

	#[test]
	fn anonymous_donor_name() {
		let frame = decode(json!({
			"cmd": 93102,
			"bdy": [{"uid": "anonymous", "profile": null, "extras": {"payAmount": 1000}}]
		}))
		.expect("decode");
		assert_eq!(donation(frame).donor_name, ANONYMOUS_DONOR);
	}

	#[test]
	fn donation_without_pay_amount_is_no_event() {
		let frame = decode(json!({
			"cmd": 93102,
			"bdy": [{"uid": "u1", "profile": {"nickname": "Carol"}, "extras": {"payType": "CURRENCY"}}]
		}))
		.expect("missing amount is not an error");
		assert_eq!(frame, None);

		let null_amount = decode(json!({
			"cmd": 93102,
			"bdy": [{"uid": "u1", "extras": {"payAmount": null}}]
		}))
		.expect("null amount is not an error");
		assert_eq!(null_amount, None);
	}

	#[test]
	fn unexpected_profile_shape_fails_closed() {
		let res = decode(json!({
			"cmd": 93101,
			"bdy": [{"uid": "u1", "msg": "hello", "profile": 42}]
		}));
		assert!(matches!(res, Err(ProtocolDecodeError::Shape { field: "profile" })));
	}

	#[test]
	fn chat_with_embedded_profile_and_color() {
		let profile = json!({
			"nickname": "Eve",
			"userRoleCode": "streaming_chat_manager",
			"streamingProperty": {"nicknameColor": "{\"colorCode\":\"CC0000\"}"}
		})
		.to_string();
		let ev = chat(
			decode(json!({
				"cmd": 93101,
				"bdy": [{"uid": "u2", "msg": "hello {:wave:} there", "profile": profile,
					"extras": {"emojis": {"wave": "https://example.invalid/wave.png"}}}]
			}))
			.expect("decode"),
		);
		assert_eq!(ev.sender_name, "Eve");
		assert_eq!(ev.sender_id.as_deref(), Some("u2"));
		assert_eq!(ev.role, ChatRole::Manager);
		assert_eq!(ev.color, NickColor::Red);
		assert_eq!(ev.text, "hello :wave: there");
		assert_eq!(ev.emojis, vec!["wave".to_string()]);
	}

	#[test]
	fn chat_unknown_role_and_color_fall_back() {
		let ev = chat(
			decode(json!({
				"cmd": 93101,
				"bdy": [{"uid": "u3", "msg": "hey", "profile": {
					"nickname": "Frank",
					"userRoleCode": "common_user",
					"streamingProperty": {"nicknameColor": {"colorCode": "123456"}}
				}}]
			}))
			.expect("decode"),
		);
		assert_eq!(ev.role, ChatRole::Viewer);
		assert_eq!(ev.color, NickColor::White);
	}

	#[test]
	fn blank_chat_is_dropped() {
		let frame = decode(json!({"cmd": 93101, "bdy": [{"uid": "u1", "msg": "   "}]})).expect("decode");
		assert_eq!(frame, None);
	}

	#[test]
	fn invalid_json_is_a_decode_error() {
		assert!(matches!(
			ChzzkCodec.decode(&Message::text("{not json")),
			Err(ProtocolDecodeError::Json(_))
		));
	}

	#[test]
	fn control_messages_decode_to_nothing() {
		assert_eq!(ChzzkCodec.decode(&Message::Ping(Vec::new().into())).expect("decode"), None);
	}
}
