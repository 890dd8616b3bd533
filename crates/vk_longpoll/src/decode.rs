#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_json::value::RawValue;
use vk_domain::{Cursor, StreamKind};

use crate::error::DecodeError;

/// Message-stream update code for a new message.
pub const CODE_NEW_MESSAGE: u32 = 4;
/// Message-stream update code for a typing notification.
pub const CODE_USER_TYPING: u32 = 61;

/// Flag values that mark a message as inbound.
///
/// This is a closed lookup table, not a bit test: any value outside it is an echo.
pub const INCOMING_MESSAGE_FLAGS: [u32; 6] = [19, 51, 531, 563, 3, 35];

/// One raw poll response.
///
/// Updates are kept undecoded so a single bad entry cannot poison the batch.
#[derive(Debug, Deserialize)]
pub struct PollResponse {
	#[serde(default)]
	pub failed: i64,
	#[serde(default)]
	pub ts: Option<Cursor>,
	#[serde(default)]
	pub updates: Vec<Box<RawValue>>,
}

/// Parse one poll body.
pub fn decode_poll_response(body: &[u8]) -> Result<PollResponse, DecodeError> {
	let resp: PollResponse = serde_json::from_slice(body).map_err(DecodeError::Response)?;
	if matches!(resp.failed, 0 | 1) && resp.ts.is_none() {
		return Err(DecodeError::MissingCursor);
	}
	Ok(resp)
}

/// Community stream event: `{type, object, group_id}`.
///
/// `object` is left as raw JSON for the handler to interpret.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupEvent {
	#[serde(rename = "type")]
	pub kind: String,
	pub group_id: u64,
	pub object: Box<RawValue>,
	#[serde(default)]
	pub event_id: Option<String>,
}

impl GroupEvent {
	/// Decode the payload into a concrete type.
	pub fn object_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
		serde_json::from_str(self.object.get())
	}
}

pub fn decode_group_update(raw: &RawValue) -> Result<GroupEvent, DecodeError> {
	let ev: GroupEvent =
		serde_json::from_str(raw.get()).map_err(|e| DecodeError::update(StreamKind::Group, e.to_string()))?;
	if ev.kind.trim().is_empty() {
		return Err(DecodeError::update(StreamKind::Group, "empty type"));
	}
	Ok(ev)
}

/// Subtype of a new-message event, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NewMessageKind {
	/// Inbound message worth notifying about.
	Incoming,
	/// Echo of an outgoing message (or anything else).
	Echo,
}

impl NewMessageKind {
	pub fn from_flags(flags: u32) -> Self {
		if INCOMING_MESSAGE_FLAGS.contains(&flags) {
			Self::Incoming
		} else {
			Self::Echo
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Incoming => "message_new",
			Self::Echo => "message_reply",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
	pub message_id: u64,
	pub flags: u32,
	pub kind: NewMessageKind,
	pub peer_id: i64,
	pub timestamp: i64,
	pub text: String,
	pub attachments: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserTyping {
	pub user_id: u64,
}

/// Message stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageEvent {
	NewMessage(NewMessage),
	UserTyping(UserTyping),
	/// Well-formed update with a code we have no schema for.
	Unrecognized { code: u32, raw: Vec<Value> },
}

impl MessageEvent {
	/// Update code this event was decoded from.
	pub fn code(&self) -> u32 {
		match self {
			Self::NewMessage(_) => CODE_NEW_MESSAGE,
			Self::UserTyping(_) => CODE_USER_TYPING,
			Self::Unrecognized { code, .. } => *code,
		}
	}
}

pub fn decode_message_update(raw: &RawValue) -> Result<MessageEvent, DecodeError> {
	let fields: Vec<Value> =
		serde_json::from_str(raw.get()).map_err(|e| DecodeError::update(StreamKind::Message, e.to_string()))?;

	let code = int_at(&fields, 0, "code")?;
	let code = u32::try_from(code).map_err(|_| DecodeError::update(StreamKind::Message, format!("bad code {code}")))?;

	match code {
		CODE_NEW_MESSAGE => decode_new_message(&fields).map(MessageEvent::NewMessage),
		CODE_USER_TYPING => {
			let user_id = int_at(&fields, 1, "user_id")?;
			let user_id = u64::try_from(user_id)
				.map_err(|_| DecodeError::update(StreamKind::Message, format!("bad user_id {user_id}")))?;
			Ok(MessageEvent::UserTyping(UserTyping { user_id }))
		}
		_ => Ok(MessageEvent::Unrecognized { code, raw: fields }),
	}
}

fn decode_new_message(fields: &[Value]) -> Result<NewMessage, DecodeError> {
	let message_id = int_at(fields, 1, "message_id")?;
	let message_id = u64::try_from(message_id)
		.map_err(|_| DecodeError::update(StreamKind::Message, format!("bad message_id {message_id}")))?;

	let flags = int_at(fields, 2, "flags")?;
	let flags =
		u32::try_from(flags).map_err(|_| DecodeError::update(StreamKind::Message, format!("bad flags {flags}")))?;

	let peer_id = int_at(fields, 3, "peer_id")?;
	let timestamp = int_at(fields, 4, "timestamp")?;

	let text = match fields.get(5) {
		Some(Value::String(s)) => s.clone(),
		other => {
			return Err(DecodeError::update(
				StreamKind::Message,
				format!("text: expected string, got {other:?}"),
			));
		}
	};

	let attachments = flatten_attachments(fields.get(7))?;

	Ok(NewMessage {
		message_id,
		flags,
		kind: NewMessageKind::from_flags(flags),
		peer_id,
		timestamp,
		text,
		attachments,
	})
}

/// Attachments slot -> `name => string`.
///
/// Strings are copied as-is; other values keep their compact JSON text.
fn flatten_attachments(slot: Option<&Value>) -> Result<BTreeMap<String, String>, DecodeError> {
	match slot {
		None | Some(Value::Null) => Ok(BTreeMap::new()),
		Some(Value::Object(map)) => Ok(map
			.iter()
			.map(|(k, v)| {
				let v = match v {
					Value::String(s) => s.clone(),
					other => other.to_string(),
				};
				(k.clone(), v)
			})
			.collect()),
		Some(other) => Err(DecodeError::update(
			StreamKind::Message,
			format!("attachments: expected object, got {other}"),
		)),
	}
}

fn int_at(fields: &[Value], idx: usize, name: &str) -> Result<i64, DecodeError> {
	let Some(v) = fields.get(idx) else {
		return Err(DecodeError::update(
			StreamKind::Message,
			format!("{name}: missing position {idx}"),
		));
	};

	if let Some(n) = v.as_i64() {
		return Ok(n);
	}

	match v.as_f64() {
		Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => Ok(f as i64),
		_ => Err(DecodeError::update(
			StreamKind::Message,
			format!("{name}: expected integer at position {idx}, got {v}"),
		)),
	}
}
