#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Long-poll event streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
	/// Community (bots) stream: keyed documents.
	Group,
	/// User/community message stream: positional arrays.
	Message,
}

impl StreamKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			StreamKind::Group => "group",
			StreamKind::Message => "message",
		}
	}
}

impl fmt::Display for StreamKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown stream: {0}")]
	UnknownStream(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for StreamKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"group" | "groups" | "bots" => Ok(StreamKind::Group),
			"message" | "messages" | "user" => Ok(StreamKind::Message),
			other => Err(ParseIdError::UnknownStream(other.to_string())),
		}
	}
}

/// Target of a long-poll subscription.
///
/// Zero means "the current actor" (whoever owns the access token).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(u64);

impl TargetId {
	/// The token owner.
	pub const CURRENT_ACTOR: TargetId = TargetId(0);

	pub const fn new(id: u64) -> Self {
		Self(id)
	}

	pub const fn get(self) -> u64 {
		self.0
	}

	pub const fn is_current_actor(self) -> bool {
		self.0 == 0
	}
}

impl fmt::Display for TargetId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_current_actor() {
			f.write_str("current")
		} else {
			write!(f, "{}", self.0)
		}
	}
}

impl FromStr for TargetId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		// Community ids are sometimes written negative (owner-id convention).
		let digits = s.strip_prefix('-').unwrap_or(s);
		digits
			.parse::<u64>()
			.map(TargetId)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected numeric id, got {s}")))
	}
}

/// Opaque stream position (`ts`).
///
/// The community stream sends it as a string, the message stream as an integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cursor {
	Number(u64),
	Text(String),
}

impl Cursor {
	/// Numeric view of the cursor, if it has one.
	pub fn as_u64(&self) -> Option<u64> {
		match self {
			Cursor::Number(n) => Some(*n),
			Cursor::Text(s) => s.trim().parse().ok(),
		}
	}

	/// Whether `next` does not move this cursor backwards.
	///
	/// Non-numeric cursors are opaque and always accepted.
	pub fn allows_advance_to(&self, next: &Cursor) -> bool {
		match (self.as_u64(), next.as_u64()) {
			(Some(cur), Some(next)) => next >= cur,
			_ => true,
		}
	}
}

impl Default for Cursor {
	fn default() -> Self {
		Cursor::Number(0)
	}
}

impl fmt::Display for Cursor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Cursor::Number(n) => write!(f, "{n}"),
			Cursor::Text(s) => f.write_str(s),
		}
	}
}

impl From<u64> for Cursor {
	fn from(v: u64) -> Self {
		Cursor::Number(v)
	}
}

impl From<&str> for Cursor {
	fn from(v: &str) -> Self {
		Cursor::Text(v.to_string())
	}
}

impl From<String> for Cursor {
	fn from(v: String) -> Self {
		Cursor::Text(v)
	}
}
