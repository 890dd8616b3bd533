#![forbid(unsafe_code)]

pub mod api;
pub mod backoff;
pub mod decode;
pub mod error;
pub mod poll_loop;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_support;

use std::fmt;

pub use api::{API_REQUEST_TIMEOUT, ApiClient, ApiMethod, DEFAULT_API_BASE_URL, DEFAULT_API_VERSION};
pub use backoff::{Backoff, BackoffConfig};
pub use decode::{
	GroupEvent, MessageEvent, NewMessage, NewMessageKind, PollResponse, UserTyping, decode_group_update,
	decode_message_update, decode_poll_response,
};
pub use error::{AcquisitionError, ApiError, DecodeError, TransportError};
pub use poll_loop::{ACQUIRE_TIMEOUT, CycleOutcome, GroupStream, MessageStream, PollLoop, StreamCodec, subscribe_group, subscribe_messages};
pub use registry::{CallbackRegistry, Handler};
pub use session::{
	FailureCode, GroupSessionAcquirer, MessageSessionAcquirer, MessageStreamOptions, Recovery, SessionAcquirer,
	SessionDescriptor, apply_recovery, mode,
};
pub use transport::{ReqwestTransport, Transport};
pub use vk_domain::{Cursor, StreamKind, TargetId};

/// Fixed long-wait timeout for every poll, in seconds.
pub const POLL_WAIT_SECONDS: u32 = 25;

/// Latest message-stream protocol version this crate decodes.
pub const LATEST_MESSAGE_PROTOCOL_VERSION: u32 = 3;

/// Registry for community stream handlers, keyed by event type.
pub type GroupRegistry = CallbackRegistry<String, GroupEvent>;

/// Registry for message stream handlers, keyed by update code.
pub type MessageRegistry = CallbackRegistry<u32, MessageEvent>;

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}
