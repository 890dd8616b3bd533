#![forbid(unsafe_code)]

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vk_longpoll::decode::{CODE_NEW_MESSAGE, CODE_USER_TYPING};
use vk_longpoll::{
	ApiClient, GroupEvent, GroupRegistry, MessageEvent, MessageRegistry, ReqwestTransport, SessionDescriptor, Transport,
	subscribe_group, subscribe_messages,
};

use crate::config::BotConfig;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: vk_bot [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.vk_bot/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,vk_longpoll=debug,vk_bot=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn group_handlers() -> Arc<GroupRegistry> {
	let registry = Arc::new(GroupRegistry::new());

	registry.register("message_new", |ev: &GroupEvent| {
		let object: serde_json::Value = ev.object_as()?;
		let text = object
			.pointer("/message/text")
			.or_else(|| object.get("text"))
			.and_then(serde_json::Value::as_str)
			.unwrap_or_default();
		info!(group_id = ev.group_id, event_id = ?ev.event_id, text, "group message");
		Ok(())
	});

	registry.register("wall_post_new", |ev: &GroupEvent| {
		let object: serde_json::Value = ev.object_as()?;
		info!(group_id = ev.group_id, post_id = ?object.get("id"), "new wall post");
		Ok(())
	});

	registry
}

fn message_handlers() -> Arc<MessageRegistry> {
	let registry = Arc::new(MessageRegistry::new());

	registry.register(CODE_NEW_MESSAGE, |ev: &MessageEvent| {
		if let MessageEvent::NewMessage(m) = ev {
			info!(
				kind = m.kind.as_str(),
				message_id = m.message_id,
				peer_id = m.peer_id,
				attachments = m.attachments.len(),
				text = %m.text,
				"message"
			);
		}
		Ok(())
	});

	registry.register(CODE_USER_TYPING, |ev: &MessageEvent| {
		if let MessageEvent::UserTyping(t) = ev {
			info!(user_id = t.user_id, "user typing");
		}
		Ok(())
	});

	registry
}

fn build_api(cfg: &BotConfig) -> anyhow::Result<ApiClient> {
	let Some(token) = cfg.access_token.clone() else {
		return Err(anyhow::anyhow!("no access token configured"));
	};
	Ok(ApiClient::new(token)?
		.with_base_url(cfg.api_base_url.clone())
		.with_api_version(cfg.api_version.clone()))
}

/// Cancel every started loop and wait for all of them to return.
async fn stop_loops(cancel: &CancellationToken, loops: Vec<JoinHandle<SessionDescriptor>>) {
	cancel.cancel();

	for result in futures::future::join_all(loops).await {
		match result {
			Ok(session) => info!(server = %session.server, cursor = %session.cursor, "stream stopped"),
			Err(e) => warn!(error = %e, "poll loop task failed"),
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_bot_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded bot config (toml + env overrides)");

	init_metrics(cfg.metrics_bind.as_deref());

	let api = build_api(&cfg)?;
	let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new()?);
	let cancel = CancellationToken::new();
	let mut loops: Vec<JoinHandle<SessionDescriptor>> = Vec::new();

	if cfg.group.enabled {
		let lp = subscribe_group(
			api.clone(),
			cfg.group.group_id,
			Arc::clone(&transport),
			group_handlers(),
			cfg.backoff,
		)
		.await?;
		info!(subscription_id = lp.subscription_id(), group_id = %cfg.group.group_id, "group stream subscribed");
		loops.push(tokio::spawn(lp.run(cancel.child_token())));
	}

	if cfg.messages.enabled {
		let lp = match subscribe_messages(
			api.clone(),
			cfg.messages.group_id,
			cfg.messages.options,
			Arc::clone(&transport),
			message_handlers(),
			cfg.backoff,
		)
		.await
		{
			Ok(lp) => lp,
			Err(e) => {
				stop_loops(&cancel, loops).await;
				return Err(e.into());
			}
		};
		info!(
			subscription_id = lp.subscription_id(),
			mode = cfg.messages.options.mode,
			version = cfg.messages.options.version,
			"message stream subscribed"
		);
		loops.push(tokio::spawn(lp.run(cancel.child_token())));
	}

	if loops.is_empty() {
		warn!("no streams enabled; nothing to do");
		return Ok(());
	}

	tokio::signal::ctrl_c().await?;
	info!("shutdown requested");
	stop_loops(&cancel, loops).await;

	Ok(())
}
