#![forbid(unsafe_code)]

use serde::Deserialize;
use tracing::debug;
use url::Url;
use vk_domain::{Cursor, StreamKind, TargetId};

use crate::api::{ApiClient, ApiMethod};
use crate::error::{AcquisitionError, TransportError};
use crate::{LATEST_MESSAGE_PROTOCOL_VERSION, POLL_WAIT_SECONDS, SecretString};

/// Connection state of one long-poll subscription.
///
/// Owned by exactly one loop and mutated in place between cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
	pub server: String,
	pub key: SecretString,
	pub cursor: Cursor,
	pub pts: Option<u64>,
	pub protocol_version: u32,
	pub wait_seconds: u32,
}

impl SessionDescriptor {
	pub fn new(server: impl Into<String>, key: SecretString, cursor: Cursor) -> Self {
		Self {
			server: server.into(),
			key,
			cursor,
			pts: None,
			protocol_version: 0,
			wait_seconds: POLL_WAIT_SECONDS,
		}
	}

	/// Build the `a_check` URL for the next poll.
	///
	/// `extra` is appended after `wait` in the given order.
	pub fn poll_url(&self, extra: &[(&'static str, String)]) -> Result<Url, TransportError> {
		let server = self.server.trim();
		let base = if server.contains("://") {
			server.to_string()
		} else {
			format!("https://{server}")
		};

		let mut url = Url::parse(&base).map_err(|e| TransportError::InvalidUrl(format!("{base}: {e}")))?;
		{
			let mut q = url.query_pairs_mut();
			q.append_pair("act", "a_check");
			q.append_pair("key", self.key.expose());
			q.append_pair("ts", &self.cursor.to_string());
			q.append_pair("wait", &self.wait_seconds.to_string());
			for (name, value) in extra {
				q.append_pair(name, value);
			}
		}
		Ok(url)
	}
}

/// `failed` member of a poll response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
	/// Events delivered; advance the cursor.
	Ok,
	/// Cursor fell out of the server's history; take the new one.
	CursorExpired,
	/// Access key expired; fetch a new key, keep position.
	KeyExpired,
	/// Key and cursor both invalid; full resync.
	SessionLost,
	/// Anything else. Treated like [`FailureCode::SessionLost`].
	Unknown(i64),
}

impl FailureCode {
	pub fn from_code(code: i64) -> Self {
		match code {
			0 => Self::Ok,
			1 => Self::CursorExpired,
			2 => Self::KeyExpired,
			3 => Self::SessionLost,
			other => Self::Unknown(other),
		}
	}

	pub fn code(self) -> i64 {
		match self {
			Self::Ok => 0,
			Self::CursorExpired => 1,
			Self::KeyExpired => 2,
			Self::SessionLost => 3,
			Self::Unknown(code) => code,
		}
	}

	/// Re-acquisition needed to recover from this code, if any.
	pub fn recovery(self) -> Option<Recovery> {
		match self {
			Self::Ok | Self::CursorExpired => None,
			Self::KeyExpired => Some(Recovery::KeyOnly),
			Self::SessionLost | Self::Unknown(_) => Some(Recovery::Full),
		}
	}
}

/// How much of a freshly acquired descriptor replaces the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
	/// Replace the access key; keep server and cursor.
	KeyOnly,
	/// Replace server, key and cursor together.
	Full,
}

/// Merge `fresh` into `current` according to `recovery`.
pub fn apply_recovery(current: &mut SessionDescriptor, recovery: Recovery, fresh: SessionDescriptor) {
	match recovery {
		Recovery::KeyOnly => {
			current.key = fresh.key;
		}
		Recovery::Full => {
			current.server = fresh.server;
			current.key = fresh.key;
			current.cursor = fresh.cursor;
			current.pts = fresh.pts;
		}
	}
}

/// Obtains a fresh session descriptor from the remote side.
#[async_trait::async_trait]
pub trait SessionAcquirer: Send + Sync + 'static {
	fn stream(&self) -> StreamKind;

	async fn acquire(&self) -> Result<SessionDescriptor, AcquisitionError>;
}

/// `{server, key, ts[, pts]}` as returned by both `getLongPollServer` methods.
#[derive(Debug, Deserialize)]
struct LongPollServer {
	server: String,
	key: SecretString,
	ts: Cursor,
	#[serde(default)]
	pts: Option<Cursor>,
}

impl LongPollServer {
	fn into_descriptor(self, stream: StreamKind, protocol_version: u32) -> Result<SessionDescriptor, AcquisitionError> {
		if self.server.trim().is_empty() {
			return Err(AcquisitionError::InvalidDescriptor {
				stream,
				reason: "empty server".to_string(),
			});
		}
		if self.key.is_empty() {
			return Err(AcquisitionError::InvalidDescriptor {
				stream,
				reason: "empty key".to_string(),
			});
		}

		let mut desc = SessionDescriptor::new(self.server, self.key, self.ts);
		desc.pts = self.pts.as_ref().and_then(Cursor::as_u64);
		desc.protocol_version = protocol_version;
		Ok(desc)
	}
}

struct GroupGetLongPollServer {
	group_id: TargetId,
}

impl ApiMethod for GroupGetLongPollServer {
	fn name(&self) -> &'static str {
		"groups.getLongPollServer"
	}

	fn params(&self) -> Vec<(&'static str, String)> {
		let mut params = Vec::new();
		if !self.group_id.is_current_actor() {
			params.push(("group_id", self.group_id.get().to_string()));
		}
		params
	}
}

struct MessagesGetLongPollServer {
	need_pts: bool,
	group_id: TargetId,
	lp_version: u32,
}

impl ApiMethod for MessagesGetLongPollServer {
	fn name(&self) -> &'static str {
		"messages.getLongPollServer"
	}

	fn params(&self) -> Vec<(&'static str, String)> {
		let mut params = vec![("need_pts", if self.need_pts { "1" } else { "0" }.to_string())];
		if !self.group_id.is_current_actor() {
			params.push(("group_id", self.group_id.get().to_string()));
		}
		params.push(("lp_version", self.lp_version.to_string()));
		params
	}
}

/// Acquires community (bots) long-poll sessions.
#[derive(Debug, Clone)]
pub struct GroupSessionAcquirer {
	api: ApiClient,
	group_id: TargetId,
}

impl GroupSessionAcquirer {
	pub fn new(api: ApiClient, group_id: TargetId) -> Self {
		Self { api, group_id }
	}
}

#[async_trait::async_trait]
impl SessionAcquirer for GroupSessionAcquirer {
	fn stream(&self) -> StreamKind {
		StreamKind::Group
	}

	async fn acquire(&self) -> Result<SessionDescriptor, AcquisitionError> {
		let method = GroupGetLongPollServer { group_id: self.group_id };
		let server: LongPollServer = self.api.call(&method).await.map_err(|source| AcquisitionError::Api {
			stream: StreamKind::Group,
			source,
		})?;

		debug!(target_id = %self.group_id, server = %server.server, ts = %server.ts, "acquired group long-poll session");
		server.into_descriptor(StreamKind::Group, 0)
	}
}

/// Named bits of the message stream `mode` parameter.
pub mod mode {
	pub const ATTACHMENTS: u32 = 2;
	pub const EXTENDED: u32 = 8;
	pub const PTS: u32 = 32;
	pub const EXTRA_ONLINE: u32 = 64;
	pub const RANDOM_ID: u32 = 128;
}

/// Per-subscription parameters of the message stream, fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageStreamOptions {
	pub mode: u32,
	pub version: u32,
}

impl Default for MessageStreamOptions {
	fn default() -> Self {
		Self {
			mode: mode::ATTACHMENTS,
			version: LATEST_MESSAGE_PROTOCOL_VERSION,
		}
	}
}

/// Acquires message long-poll sessions.
#[derive(Debug, Clone)]
pub struct MessageSessionAcquirer {
	api: ApiClient,
	group_id: TargetId,
	need_pts: bool,
	lp_version: u32,
}

impl MessageSessionAcquirer {
	pub fn new(api: ApiClient, group_id: TargetId, options: MessageStreamOptions) -> Self {
		Self {
			api,
			group_id,
			need_pts: options.mode & mode::PTS != 0,
			lp_version: options.version,
		}
	}
}

#[async_trait::async_trait]
impl SessionAcquirer for MessageSessionAcquirer {
	fn stream(&self) -> StreamKind {
		StreamKind::Message
	}

	async fn acquire(&self) -> Result<SessionDescriptor, AcquisitionError> {
		let method = MessagesGetLongPollServer {
			need_pts: self.need_pts,
			group_id: self.group_id,
			lp_version: self.lp_version,
		};
		let server: LongPollServer = self.api.call(&method).await.map_err(|source| AcquisitionError::Api {
			stream: StreamKind::Message,
			source,
		})?;

		debug!(target_id = %self.group_id, server = %server.server, ts = %server.ts, "acquired message long-poll session");
		server.into_descriptor(StreamKind::Message, self.lp_version)
	}
}
