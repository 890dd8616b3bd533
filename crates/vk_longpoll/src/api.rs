#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use tracing::debug;

use crate::SecretString;
use crate::error::ApiError;

pub const DEFAULT_API_BASE_URL: &str = "https://api.vk.com";
pub const DEFAULT_API_VERSION: &str = "5.103";

/// Upper bound on one method call, connect through body.
pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// A remote method: its name and form parameters.
///
/// `v` and `access_token` are appended by [`ApiClient`].
pub trait ApiMethod {
	fn name(&self) -> &'static str;

	fn params(&self) -> Vec<(&'static str, String)>;
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
	#[serde(default)]
	response: Option<Box<RawValue>>,
	#[serde(default)]
	error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
	error_code: i64,
	#[serde(default)]
	error_msg: String,
}

/// Form-POST client for the method endpoint.
#[derive(Debug, Clone)]
pub struct ApiClient {
	base_url: String,
	api_version: String,
	access_token: SecretString,
	http: reqwest::Client,
}

impl ApiClient {
	pub fn new(access_token: SecretString) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("vk_longpoll/0.x (api)")
			.timeout(API_REQUEST_TIMEOUT)
			.build()
			.context("build reqwest client")?;
		Ok(Self::with_client(DEFAULT_API_BASE_URL, access_token, http))
	}

	pub fn with_client(base_url: impl Into<String>, access_token: SecretString, http: reqwest::Client) -> Self {
		Self {
			base_url: base_url.into(),
			api_version: DEFAULT_API_VERSION.to_string(),
			access_token,
			http,
		}
	}

	pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
		self.base_url = base_url.into();
		self
	}

	pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
		self.api_version = version.into();
		self
	}

	fn method_url(&self, name: &str) -> String {
		format!("{}/method/{}", self.base_url.trim_end_matches('/'), name)
	}

	/// Call `method` and decode its `response` member into `T`.
	pub async fn call<M, T>(&self, method: &M) -> Result<T, ApiError>
	where
		M: ApiMethod + ?Sized,
		T: DeserializeOwned,
	{
		let name = method.name();
		let mut form = method.params();
		form.push(("v", self.api_version.clone()));
		form.push(("access_token", self.access_token.expose().to_string()));

		debug!(method = name, "api call");

		let resp = self
			.http
			.post(self.method_url(name))
			.form(&form)
			.send()
			.await
			.map_err(|source| ApiError::Http { method: name, source })?;

		let body = resp
			.text()
			.await
			.map_err(|source| ApiError::Http { method: name, source })?;

		decode_envelope(name, &body)
	}
}

pub(crate) fn decode_envelope<T: DeserializeOwned>(method: &'static str, body: &str) -> Result<T, ApiError> {
	let envelope: ApiEnvelope = serde_json::from_str(body).map_err(|source| ApiError::Decode { method, source })?;

	if let Some(err) = envelope.error {
		return Err(ApiError::Remote {
			method,
			code: err.error_code,
			message: err.error_msg,
		});
	}

	let Some(response) = envelope.response else {
		return Err(ApiError::EmptyResponse { method });
	};

	serde_json::from_str(response.get()).map_err(|source| ApiError::Decode { method, source })
}
