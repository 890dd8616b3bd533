#![forbid(unsafe_code)]

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;
use vk_domain::{StreamKind, TargetId};

use crate::api::ApiClient;
use crate::backoff::{Backoff, BackoffConfig};
use crate::decode::{GroupEvent, MessageEvent, decode_group_update, decode_message_update, decode_poll_response};
use crate::error::{AcquisitionError, DecodeError};
use crate::registry::CallbackRegistry;
use crate::session::{
	FailureCode, GroupSessionAcquirer, MessageSessionAcquirer, MessageStreamOptions, Recovery, SessionAcquirer,
	SessionDescriptor, apply_recovery,
};
use crate::transport::{POLL_TIMEOUT_GRACE, Transport};

/// Upper bound on one re-acquisition during recovery.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Stream-specific half of a poll loop: update schema and poll parameters.
pub trait StreamCodec: Send + Sync + 'static {
	type Event: Send + Sync + 'static;
	type Key: Eq + Hash + fmt::Debug + Send + Sync + 'static;

	fn kind(&self) -> StreamKind;

	/// Parameters appended to every poll URL after `wait`.
	fn extra_params(&self) -> Vec<(&'static str, String)>;

	fn decode(&self, raw: &RawValue) -> Result<Self::Event, DecodeError>;

	/// Registry key for `event`, or `None` if it is never dispatched.
	fn dispatch_key(&self, event: &Self::Event) -> Option<Self::Key>;
}

/// Community stream: dispatches by event `type`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupStream;

impl StreamCodec for GroupStream {
	type Event = GroupEvent;
	type Key = String;

	fn kind(&self) -> StreamKind {
		StreamKind::Group
	}

	fn extra_params(&self) -> Vec<(&'static str, String)> {
		Vec::new()
	}

	fn decode(&self, raw: &RawValue) -> Result<GroupEvent, DecodeError> {
		decode_group_update(raw)
	}

	fn dispatch_key(&self, event: &GroupEvent) -> Option<String> {
		Some(event.kind.clone())
	}
}

/// Message stream: dispatches by update code.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageStream {
	pub options: MessageStreamOptions,
}

impl StreamCodec for MessageStream {
	type Event = MessageEvent;
	type Key = u32;

	fn kind(&self) -> StreamKind {
		StreamKind::Message
	}

	fn extra_params(&self) -> Vec<(&'static str, String)> {
		vec![
			("mode", self.options.mode.to_string()),
			("version", self.options.version.to_string()),
		]
	}

	fn decode(&self, raw: &RawValue) -> Result<MessageEvent, DecodeError> {
		decode_message_update(raw)
	}

	fn dispatch_key(&self, event: &MessageEvent) -> Option<u32> {
		match event {
			MessageEvent::Unrecognized { code, .. } => {
				debug!(code, "ignoring unrecognized message update");
				None
			}
			other => Some(other.code()),
		}
	}
}

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
	/// `failed=0`: updates decoded and handed to the registry.
	Delivered {
		dispatched: usize,
		skipped: usize,
		handler_errors: usize,
	},
	/// `failed=1`: cursor replaced, nothing delivered.
	CursorRefreshed,
	/// Session re-acquired and merged.
	Resynced(Recovery),
	/// Network failure; descriptor unchanged.
	TransportFailed,
	/// Body was not a poll response; descriptor unchanged.
	DecodeFailed,
	/// Re-acquisition failed; it will be retried next cycle.
	RecoveryFailed(Recovery),
}

impl CycleOutcome {
	pub fn is_failure(&self) -> bool {
		matches!(
			self,
			Self::TransportFailed | Self::DecodeFailed | Self::RecoveryFailed(_)
		)
	}
}

/// Drives one subscription until cancelled.
pub struct PollLoop<S: StreamCodec> {
	codec: S,
	session: SessionDescriptor,
	transport: Arc<dyn Transport>,
	acquirer: Arc<dyn SessionAcquirer>,
	registry: Arc<CallbackRegistry<S::Key, S::Event>>,
	pending_recovery: Option<Recovery>,
	backoff: Backoff,
	acquire_timeout: Duration,
	cancel: CancellationToken,
	subscription_id: String,
}

impl<S: StreamCodec> PollLoop<S> {
	pub fn new(
		codec: S,
		session: SessionDescriptor,
		transport: Arc<dyn Transport>,
		acquirer: Arc<dyn SessionAcquirer>,
		registry: Arc<CallbackRegistry<S::Key, S::Event>>,
		backoff: BackoffConfig,
	) -> Self {
		Self {
			codec,
			session,
			transport,
			acquirer,
			registry,
			pending_recovery: None,
			backoff: Backoff::new(backoff),
			acquire_timeout: ACQUIRE_TIMEOUT,
			cancel: CancellationToken::new(),
			subscription_id: Uuid::new_v4().to_string(),
		}
	}

	/// Acquire the initial session. Failure here aborts the subscription.
	pub async fn start(
		codec: S,
		transport: Arc<dyn Transport>,
		acquirer: Arc<dyn SessionAcquirer>,
		registry: Arc<CallbackRegistry<S::Key, S::Event>>,
		backoff: BackoffConfig,
	) -> Result<Self, AcquisitionError> {
		let stream = acquirer.stream();
		let session = match acquirer.acquire().await {
			Ok(session) => session,
			Err(e) => {
				warn!(%stream, error = %e, "initial long-poll session acquisition failed");
				return Err(e);
			}
		};

		info!(%stream, server = %session.server, cursor = %session.cursor, "long-poll session acquired");
		Ok(Self::new(codec, session, transport, acquirer, registry, backoff))
	}

	pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
		self.acquire_timeout = timeout;
		self
	}

	pub fn session(&self) -> &SessionDescriptor {
		&self.session
	}

	pub fn pending_recovery(&self) -> Option<Recovery> {
		self.pending_recovery
	}

	pub fn subscription_id(&self) -> &str {
		&self.subscription_id
	}

	/// Poll until `cancel` fires, then return the final descriptor.
	///
	/// Cancellation is observed between cycles, during backoff and during
	/// re-acquisition, never mid-poll.
	pub async fn run(mut self, cancel: CancellationToken) -> SessionDescriptor {
		self.cancel = cancel.clone();
		let stream = self.codec.kind();
		let span = info_span!("longpoll", %stream, subscription_id = %self.subscription_id);

		async move {
			info!("poll loop started");
			loop {
				if cancel.is_cancelled() {
					break;
				}

				let outcome = self.run_cycle().await;
				if !outcome.is_failure() {
					self.backoff.reset();
					continue;
				}

				let delay = self.backoff.next_delay();
				if delay.is_zero() {
					continue;
				}

				debug!(?outcome, attempt = self.backoff.attempt(), delay_ms = delay.as_millis() as u64, "backing off");
				tokio::select! {
					_ = cancel.cancelled() => break,
					_ = tokio::time::sleep(delay) => {}
				}
			}
			info!(cursor = %self.session.cursor, "poll loop stopped");
			self.session
		}
		.instrument(span)
		.await
	}

	/// Execute exactly one cycle: either a pending re-acquisition or one poll.
	pub async fn run_cycle(&mut self) -> CycleOutcome {
		if let Some(recovery) = self.pending_recovery {
			return self.recover(recovery).await;
		}

		let stream = self.codec.kind().as_str();

		let url = match self.session.poll_url(&self.codec.extra_params()) {
			Ok(url) => url,
			Err(e) => {
				// The server address came from acquisition; only a new one can fix it.
				warn!(error = %e, "cannot build poll url; scheduling full resync");
				self.pending_recovery = Some(Recovery::Full);
				return CycleOutcome::TransportFailed;
			}
		};

		let timeout = Duration::from_secs(u64::from(self.session.wait_seconds)) + POLL_TIMEOUT_GRACE;
		metrics::counter!("vk_longpoll_polls_total", "stream" => stream).increment(1);

		let body = match self.transport.get(&url, timeout).await {
			Ok(body) => body,
			Err(e) => {
				metrics::counter!("vk_longpoll_transport_errors_total", "stream" => stream).increment(1);
				warn!(error = %e, "long-poll request failed; retrying with same session");
				return CycleOutcome::TransportFailed;
			}
		};

		let resp = match decode_poll_response(&body) {
			Ok(resp) => resp,
			Err(e) => {
				metrics::counter!("vk_longpoll_decode_errors_total", "stream" => stream).increment(1);
				warn!(error = %e, body_len = body.len(), "undecodable long-poll response; retrying with same session");
				return CycleOutcome::DecodeFailed;
			}
		};

		match FailureCode::from_code(resp.failed) {
			FailureCode::Ok => {
				let outcome = self.deliver(&resp.updates);
				if let Some(ts) = resp.ts {
					if self.session.cursor.allows_advance_to(&ts) {
						self.session.cursor = ts;
					} else {
						warn!(cursor = %self.session.cursor, ts = %ts, "server moved cursor backwards; keeping current");
					}
				}
				outcome
			}
			FailureCode::CursorExpired => {
				if let Some(ts) = resp.ts {
					debug!(old = %self.session.cursor, new = %ts, "cursor expired; taking server cursor");
					self.session.cursor = ts;
				}
				CycleOutcome::CursorRefreshed
			}
			code => {
				if let FailureCode::Unknown(failed) = code {
					warn!(failed, "unknown long-poll failure code; forcing full resync");
				} else {
					info!(failed = code.code(), "long-poll session invalidated");
				}
				let recovery = code.recovery().unwrap_or(Recovery::Full);
				self.recover(recovery).await
			}
		}
	}

	fn deliver(&self, updates: &[Box<RawValue>]) -> CycleOutcome {
		let stream = self.codec.kind().as_str();
		let mut dispatched = 0usize;
		let mut skipped = 0usize;
		let mut handler_errors = 0usize;

		for raw in updates {
			let event = match self.codec.decode(raw) {
				Ok(event) => event,
				Err(e) => {
					skipped += 1;
					metrics::counter!("vk_longpoll_decode_errors_total", "stream" => stream).increment(1);
					warn!(error = %e, "skipping malformed update");
					continue;
				}
			};

			let Some(key) = self.codec.dispatch_key(&event) else {
				continue;
			};

			match self.registry.dispatch(&key, &event) {
				Ok(true) => {
					dispatched += 1;
					metrics::counter!("vk_longpoll_events_dispatched_total", "stream" => stream).increment(1);
				}
				Ok(false) => {}
				Err(e) => {
					handler_errors += 1;
					metrics::counter!("vk_longpoll_handler_errors_total", "stream" => stream).increment(1);
					warn!(?key, error = ?e, "event handler failed");
				}
			}
		}

		CycleOutcome::Delivered {
			dispatched,
			skipped,
			handler_errors,
		}
	}

	async fn recover(&mut self, recovery: Recovery) -> CycleOutcome {
		let stream = self.acquirer.stream();
		let acquired = tokio::select! {
			_ = self.cancel.cancelled() => None,
			res = tokio::time::timeout(self.acquire_timeout, self.acquirer.acquire()) => Some(res),
		};

		let error = match acquired {
			Some(Ok(Ok(fresh))) => {
				apply_recovery(&mut self.session, recovery, fresh);
				self.pending_recovery = None;
				metrics::counter!("vk_longpoll_resyncs_total", "stream" => stream.as_str()).increment(1);
				info!(%stream, ?recovery, server = %self.session.server, cursor = %self.session.cursor, "long-poll session recovered");
				return CycleOutcome::Resynced(recovery);
			}
			Some(Ok(Err(e))) => e.to_string(),
			Some(Err(_)) => format!("timed out after {:?}", self.acquire_timeout),
			None => "cancelled".to_string(),
		};

		let recovery = match self.pending_recovery {
			Some(Recovery::Full) => Recovery::Full,
			_ => recovery,
		};
		self.pending_recovery = Some(recovery);
		warn!(%stream, ?recovery, %error, "long-poll session re-acquisition failed; will retry");
		CycleOutcome::RecoveryFailed(recovery)
	}
}

/// Start the community stream for `group_id`.
pub async fn subscribe_group(
	api: ApiClient,
	group_id: TargetId,
	transport: Arc<dyn Transport>,
	registry: Arc<CallbackRegistry<String, GroupEvent>>,
	backoff: BackoffConfig,
) -> Result<PollLoop<GroupStream>, AcquisitionError> {
	let acquirer = Arc::new(GroupSessionAcquirer::new(api, group_id));
	PollLoop::start(GroupStream, transport, acquirer, registry, backoff).await
}

/// Start the message stream for `group_id` (zero for the token owner).
pub async fn subscribe_messages(
	api: ApiClient,
	group_id: TargetId,
	options: MessageStreamOptions,
	transport: Arc<dyn Transport>,
	registry: Arc<CallbackRegistry<u32, MessageEvent>>,
	backoff: BackoffConfig,
) -> Result<PollLoop<MessageStream>, AcquisitionError> {
	let acquirer = Arc::new(MessageSessionAcquirer::new(api, group_id, options));
	PollLoop::start(MessageStream { options }, transport, acquirer, registry, backoff).await
}
