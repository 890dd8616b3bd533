#![forbid(unsafe_code)]

use thiserror::Error;
use vk_domain::StreamKind;

/// Failure of a one-shot API method call.
#[derive(Debug, Error)]
pub enum ApiError {
	/// The request never produced a response body.
	#[error("api request failed ({method}): {source}")]
	Http {
		method: &'static str,
		#[source]
		source: reqwest::Error,
	},

	/// The remote side answered with an `error` member.
	#[error("api error {code} ({method}): {message}")]
	Remote {
		method: &'static str,
		code: i64,
		message: String,
	},

	/// The envelope or its `response` member did not match the expected shape.
	#[error("api decode failed ({method}): {source}")]
	Decode {
		method: &'static str,
		#[source]
		source: serde_json::Error,
	},

	/// The envelope carried neither `response` nor `error`.
	#[error("api response for {method} is empty")]
	EmptyResponse { method: &'static str },
}

impl ApiError {
	/// Remote error code, if the server produced one.
	pub fn remote_code(&self) -> Option<i64> {
		match self {
			Self::Remote { code, .. } => Some(*code),
			_ => None,
		}
	}
}

/// Failure to obtain a long-poll session descriptor.
#[derive(Debug, Error)]
pub enum AcquisitionError {
	#[error("{stream} session acquisition failed: {source}")]
	Api {
		stream: StreamKind,
		#[source]
		source: ApiError,
	},

	/// The server returned a descriptor missing something we need to poll.
	#[error("{stream} session descriptor is invalid: {reason}")]
	InvalidDescriptor { stream: StreamKind, reason: String },
}

/// Network-level failure of one poll request.
#[derive(Debug, Error)]
pub enum TransportError {
	#[error("invalid poll url: {0}")]
	InvalidUrl(String),

	#[error("poll request failed: {0}")]
	Request(#[source] reqwest::Error),

	#[error("poll returned status {status}")]
	Status { status: u16 },

	#[error("poll body read failed: {0}")]
	Body(#[source] reqwest::Error),

	/// Used by non-reqwest transports.
	#[error("poll transport error: {0}")]
	Other(String),
}

/// Failure to decode a poll response or one of its updates.
#[derive(Debug, Error)]
pub enum DecodeError {
	/// The whole body is not a poll response.
	#[error("malformed poll response: {0}")]
	Response(#[source] serde_json::Error),

	/// A success response arrived without a new cursor.
	#[error("poll response has no ts")]
	MissingCursor,

	/// One update inside an otherwise valid batch.
	#[error("malformed {stream} update: {reason}")]
	Update { stream: StreamKind, reason: String },
}

impl DecodeError {
	pub(crate) fn update(stream: StreamKind, reason: impl Into<String>) -> Self {
		Self::Update {
			stream,
			reason: reason.into(),
		}
	}
}
