#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;
use vk_domain::{Cursor, StreamKind};

use crate::SecretString;
use crate::error::{AcquisitionError, ApiError, TransportError};
use crate::session::{SessionAcquirer, SessionDescriptor};
use crate::transport::Transport;

/// Transport that replays a fixed script and records every requested URL.
///
/// Once the script runs out it fails every request and fires `on_exhausted`.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
	script: Mutex<VecDeque<Result<String, TransportError>>>,
	pub(crate) urls: Mutex<Vec<Url>>,
	pub(crate) timeouts: Mutex<Vec<Duration>>,
	on_exhausted: Option<CancellationToken>,
}

impl ScriptedTransport {
	pub(crate) fn new(script: Vec<Result<&str, TransportError>>) -> Arc<Self> {
		Arc::new(Self::build(script, None))
	}

	pub(crate) fn cancelling(script: Vec<Result<&str, TransportError>>, cancel: CancellationToken) -> Arc<Self> {
		Arc::new(Self::build(script, Some(cancel)))
	}

	fn build(script: Vec<Result<&str, TransportError>>, on_exhausted: Option<CancellationToken>) -> Self {
		Self {
			script: Mutex::new(script.into_iter().map(|r| r.map(str::to_string)).collect()),
			urls: Mutex::new(Vec::new()),
			timeouts: Mutex::new(Vec::new()),
			on_exhausted,
		}
	}

	pub(crate) fn calls(&self) -> usize {
		self.urls.lock().len()
	}

	pub(crate) fn url(&self, idx: usize) -> Url {
		self.urls.lock()[idx].clone()
	}
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
	async fn get(&self, url: &Url, timeout: Duration) -> Result<Bytes, TransportError> {
		self.urls.lock().push(url.clone());
		self.timeouts.lock().push(timeout);

		let next = self.script.lock().pop_front();
		match next {
			Some(Ok(body)) => Ok(Bytes::from(body)),
			Some(Err(e)) => Err(e),
			None => {
				if let Some(cancel) = &self.on_exhausted {
					cancel.cancel();
				}
				Err(TransportError::Other("script exhausted".to_string()))
			}
		}
	}
}

pub(crate) fn network_error() -> TransportError {
	TransportError::Other("connection reset".to_string())
}

/// Acquirer that hands out scripted descriptors and counts calls.
pub(crate) struct ScriptedAcquirer {
	stream: StreamKind,
	script: Mutex<VecDeque<Option<SessionDescriptor>>>,
	calls: AtomicUsize,
}

impl ScriptedAcquirer {
	/// `None` entries fail with a remote error.
	pub(crate) fn new(stream: StreamKind, script: Vec<Option<SessionDescriptor>>) -> Arc<Self> {
		Arc::new(Self {
			stream,
			script: Mutex::new(script.into()),
			calls: AtomicUsize::new(0),
		})
	}

	pub(crate) fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl SessionAcquirer for ScriptedAcquirer {
	fn stream(&self) -> StreamKind {
		self.stream
	}

	async fn acquire(&self) -> Result<SessionDescriptor, AcquisitionError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		match self.script.lock().pop_front().flatten() {
			Some(desc) => Ok(desc),
			None => Err(AcquisitionError::Api {
				stream: self.stream,
				source: ApiError::Remote {
					method: "scripted.getLongPollServer",
					code: 10,
					message: "internal server error".to_string(),
				},
			}),
		}
	}
}

/// Acquirer whose calls never complete.
pub(crate) struct StalledAcquirer {
	stream: StreamKind,
	calls: AtomicUsize,
}

impl StalledAcquirer {
	pub(crate) fn new(stream: StreamKind) -> Arc<Self> {
		Arc::new(Self {
			stream,
			calls: AtomicUsize::new(0),
		})
	}

	pub(crate) fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl SessionAcquirer for StalledAcquirer {
	fn stream(&self) -> StreamKind {
		self.stream
	}

	async fn acquire(&self) -> Result<SessionDescriptor, AcquisitionError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		std::future::pending().await
	}
}

pub(crate) fn descriptor(server: &str, key: &str, cursor: impl Into<Cursor>) -> SessionDescriptor {
	SessionDescriptor::new(server, SecretString::new(key), cursor.into())
}
