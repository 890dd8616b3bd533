#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};
use vk_domain::TargetId;
use vk_longpoll::{BackoffConfig, DEFAULT_API_BASE_URL, DEFAULT_API_VERSION, MessageStreamOptions, SecretString};


/// Default config path: `~/.vk_bot/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".vk_bot").join("config.toml"))
}

/// Load the bot config from TOML and process env overrides.
pub fn load_bot_config_from_path(path: &Path) -> anyhow::Result<BotConfig> {
	load_bot_config_with_env(path, |key| std::env::var(key).ok())
}

/// Same as `load_bot_config_from_path` with an explicit env lookup.
pub fn load_bot_config_with_env(path: &Path, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<BotConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = BotConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, env);

	if cfg.access_token.is_none() {
		return Err(anyhow!(
			"no access token configured (set access_token in {} or VK_BOT_ACCESS_TOKEN)",
			path.display()
		));
	}

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct BotConfig {
	pub access_token: Option<SecretString>,
	pub api_base_url: String,
	pub api_version: String,
	pub group: GroupSettings,
	pub messages: MessageSettings,
	pub backoff: BackoffConfig,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

/// Community (bots) stream.
#[derive(Debug, Clone, Default)]
pub struct GroupSettings {
	pub enabled: bool,
	pub group_id: TargetId,
}

/// Message stream.
#[derive(Debug, Clone, Default)]
pub struct MessageSettings {
	pub enabled: bool,
	/// Zero means the token owner.
	pub group_id: TargetId,
	pub options: MessageStreamOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	access_token: Option<String>,
	api_base_url: Option<String>,
	api_version: Option<String>,
	metrics_bind: Option<String>,

	#[serde(default)]
	group: FileGroupSettings,

	#[serde(default)]
	messages: FileMessageSettings,

	#[serde(default)]
	backoff: FileBackoffSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileGroupSettings {
	enabled: Option<bool>,
	group_id: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileMessageSettings {
	enabled: Option<bool>,
	group_id: Option<u64>,
	mode: Option<u32>,
	version: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBackoffSettings {
	min_delay_ms: Option<u64>,
	max_delay_ms: Option<u64>,
}

impl BotConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = BackoffConfig::default();
		let message_defaults = MessageStreamOptions::default();

		Self {
			access_token: file.access_token.filter(|s| !s.trim().is_empty()).map(SecretString::new),
			api_base_url: file
				.api_base_url
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
			api_version: file
				.api_version
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
			group: GroupSettings {
				enabled: file.group.enabled.unwrap_or(false),
				group_id: TargetId::new(file.group.group_id.unwrap_or(0)),
			},
			messages: MessageSettings {
				enabled: file.messages.enabled.unwrap_or(true),
				group_id: TargetId::new(file.messages.group_id.unwrap_or(0)),
				options: MessageStreamOptions {
					mode: file.messages.mode.unwrap_or(message_defaults.mode),
					version: file.messages.version.unwrap_or(message_defaults.version),
				},
			},
			backoff: BackoffConfig {
				min_delay: file
					.backoff
					.min_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.min_delay),
				max_delay: file
					.backoff
					.max_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.max_delay),
			},
			metrics_bind: file.metrics_bind.filter(|s| !s.trim().is_empty()),
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut BotConfig, env: impl Fn(&str) -> Option<String>) {
	if let Some(v) = env("VK_BOT_ACCESS_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.access_token = Some(SecretString::new(v));
			info!("bot config: access_token overridden by env");
		}
	}

	if let Some(v) = env("VK_BOT_API_BASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.api_base_url = v;
			info!("bot config: api_base_url overridden by env");
		}
	}

	if let Some(v) = env("VK_BOT_GROUP_ID")
		&& let Ok(id) = v.trim().parse::<TargetId>()
	{
		cfg.group.group_id = id;
		cfg.messages.group_id = id;
		info!(group_id = %id, "bot config: group_id overridden by env");
	}

	if let Some(v) = env("VK_BOT_GROUP_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.group.enabled = enabled;
		info!(enabled, "bot config: group.enabled overridden by env");
	}

	if let Some(v) = env("VK_BOT_MESSAGES_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.messages.enabled = enabled;
		info!(enabled, "bot config: messages.enabled overridden by env");
	}

	if let Some(v) = env("VK_BOT_MESSAGES_MODE")
		&& let Ok(mode) = v.trim().parse::<u32>()
	{
		cfg.messages.options.mode = mode;
		info!(mode, "bot config: messages.mode overridden by env");
	}

	if let Some(v) = env("VK_BOT_BACKOFF_MIN_MS")
		&& let Ok(min_ms) = v.trim().parse::<u64>()
	{
		cfg.backoff.min_delay = Duration::from_millis(min_ms);
		info!(min_ms, "bot config: backoff.min_delay overridden by env");
	}

	if let Some(v) = env("VK_BOT_BACKOFF_MAX_MS")
		&& let Ok(max_ms) = v.trim().parse::<u64>()
	{
		cfg.backoff.max_delay = Duration::from_millis(max_ms);
		info!(max_ms, "bot config: backoff.max_delay overridden by env");
	}

	if let Some(v) = env("VK_BOT_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.metrics_bind = Some(v);
			info!("bot config: metrics_bind overridden by env");
		}
	}

	if cfg.group.enabled && cfg.group.group_id.is_current_actor() {
		warn!("bot config: group stream enabled without group_id; acquisition will likely fail");
	}

	if cfg.backoff.min_delay > cfg.backoff.max_delay {
		warn!(
			min_ms = cfg.backoff.min_delay.as_millis(),
			max_ms = cfg.backoff.max_delay.as_millis(),
			"bot config: backoff min_delay > max_delay; swapping"
		);
		std::mem::swap(&mut cfg.backoff.min_delay, &mut cfg.backoff.max_delay);
	}
}
