#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use url::Url;

use crate::error::TransportError;

/// Extra time granted on top of the long-poll wait before a request is abandoned.
pub const POLL_TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Issues a single GET and returns the raw body.
///
/// Implementations must be safe to share between concurrently running loops.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
	async fn get(&self, url: &Url, timeout: Duration) -> Result<Bytes, TransportError>;
}

/// reqwest-backed [`Transport`].
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
	http: reqwest::Client,
}

impl ReqwestTransport {
	pub fn new() -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("vk_longpoll/0.x (long-poll)")
			.build()
			.context("build reqwest client")?;
		Ok(Self { http })
	}

	pub fn from_client(http: reqwest::Client) -> Self {
		Self { http }
	}
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
	async fn get(&self, url: &Url, timeout: Duration) -> Result<Bytes, TransportError> {
		let resp = self
			.http
			.get(url.clone())
			.timeout(timeout)
			.send()
			.await
			.map_err(TransportError::Request)?;

		let status = resp.status();
		if !status.is_success() {
			return Err(TransportError::Status {
				status: status.as_u16(),
			});
		}

		resp.bytes().await.map_err(TransportError::Body)
	}
}
