#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use vk_longpoll::{
	AcquisitionError, ApiClient, BackoffConfig, Cursor, CycleOutcome, GroupEvent, GroupRegistry, MessageRegistry,
	MessageStreamOptions, Recovery, ReqwestTransport, SecretString, TargetId, subscribe_group, subscribe_messages,
};

/// Fake API + long-poll server. Poll bodies are served in order; the last one repeats.
#[derive(Default)]
struct FakeVk {
	addr: Mutex<Option<SocketAddr>>,
	acquisitions: Mutex<Vec<String>>,
	polls: Mutex<Vec<String>>,
	poll_script: Mutex<Vec<(StatusCode, &'static str)>>,
}

impl FakeVk {
	fn base(&self) -> String {
		let addr = (*self.addr.lock()).expect("server bound");
		format!("http://{addr}")
	}

	fn next_poll(&self) -> (StatusCode, &'static str) {
		let mut script = self.poll_script.lock();
		if script.len() > 1 { script.remove(0) } else { script[0] }
	}
}

async fn spawn_fake(script: Vec<(StatusCode, &'static str)>) -> Arc<FakeVk> {
	let fake = Arc::new(FakeVk {
		poll_script: Mutex::new(script),
		..FakeVk::default()
	});
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	*fake.addr.lock() = Some(listener.local_addr().unwrap());

	let state = fake.clone();
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				return;
			};
			let io = TokioIo::new(stream);
			let state = state.clone();
			tokio::spawn(async move {
				let service = service_fn(move |req| handle(req, state.clone()));
				let _ = http1::Builder::new().serve_connection(io, service).await;
			});
		}
	});
	fake
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	Response::builder().status(status).body(Full::new(body.into())).unwrap()
}

async fn handle(req: Request<Incoming>, state: Arc<FakeVk>) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let path = req.uri().path().to_string();
	let query = req.uri().query().unwrap_or_default().to_string();
	let method = req.method().clone();

	match (method, path.as_str()) {
		(Method::POST, "/method/groups.getLongPollServer") | (Method::POST, "/method/messages.getLongPollServer") => {
			let form = String::from_utf8_lossy(&req.into_body().collect().await?.to_bytes()).into_owned();
			let n = {
				let mut acq = state.acquisitions.lock();
				acq.push(format!("{path}?{form}"));
				acq.len()
			};
			if form.contains("access_token=bad") {
				return Ok(respond(
					StatusCode::OK,
					r#"{"error":{"error_code":5,"error_msg":"User authorization failed"}}"#,
				));
			}
			let body = format!(
				r#"{{"response":{{"server":"{}/lp","key":"k{n}","ts":"{}"}}}}"#,
				state.base(),
				n * 10
			);
			Ok(respond(StatusCode::OK, body))
		}
		(Method::GET, "/lp") => {
			state.polls.lock().push(query);
			let (status, body) = state.next_poll();
			Ok(respond(status, body))
		}
		_ => Ok(respond(StatusCode::NOT_FOUND, Bytes::new())),
	}
}

fn api(fake: &FakeVk, token: &str) -> ApiClient {
	ApiClient::with_client(fake.base(), SecretString::new(token), reqwest::Client::new())
}

fn transport() -> Arc<ReqwestTransport> {
	Arc::new(ReqwestTransport::from_client(reqwest::Client::new()))
}

#[tokio::test]
async fn group_stream_end_to_end() {
	let fake = spawn_fake(vec![
		(
			StatusCode::OK,
			r#"{"ts":"11","updates":[{"type":"message_new","group_id":5,"object":{"id":1}}]}"#,
		),
		(StatusCode::OK, r#"{"failed":2}"#),
		(StatusCode::BAD_GATEWAY, "upstream"),
		(StatusCode::OK, r#"{"ts":"12","updates":[]}"#),
	])
	.await;

	let registry: Arc<GroupRegistry> = Arc::default();
	let seen = Arc::new(Mutex::new(Vec::new()));
	let s = seen.clone();
	registry.register("message_new", move |ev: &GroupEvent| {
		s.lock().push(ev.group_id);
		Ok(())
	});

	let mut lp = subscribe_group(
		api(&fake, "tok"),
		TargetId::new(5),
		transport(),
		registry,
		BackoffConfig::none(),
	)
	.await
	.unwrap();
	assert_eq!(lp.session().cursor, Cursor::Text("10".to_string()));

	assert!(matches!(lp.run_cycle().await, CycleOutcome::Delivered { dispatched: 1, .. }));
	assert_eq!(lp.session().cursor, Cursor::Text("11".to_string()));

	assert_eq!(lp.run_cycle().await, CycleOutcome::Resynced(Recovery::KeyOnly));
	assert_eq!(lp.session().key, SecretString::new("k2"));
	assert_eq!(lp.session().cursor, Cursor::Text("11".to_string()));

	assert_eq!(lp.run_cycle().await, CycleOutcome::TransportFailed);
	assert!(matches!(lp.run_cycle().await, CycleOutcome::Delivered { dispatched: 0, .. }));

	assert_eq!(*seen.lock(), vec![5]);

	let acquisitions = fake.acquisitions.lock().clone();
	assert_eq!(acquisitions.len(), 2);
	assert!(acquisitions[0].starts_with("/method/groups.getLongPollServer?"));
	assert!(acquisitions[0].contains("group_id=5"), "{}", acquisitions[0]);
	assert!(acquisitions[0].contains("v=5.103"));
	assert!(acquisitions[0].contains("access_token=tok"));

	let polls = fake.polls.lock().clone();
	assert_eq!(polls[0], "act=a_check&key=k1&ts=10&wait=25");
	assert_eq!(polls[2], "act=a_check&key=k2&ts=11&wait=25");
	assert_eq!(polls[3], polls[2]);
}

#[tokio::test]
async fn message_stream_requests_pts_when_mode_asks_for_it() {
	let fake = spawn_fake(vec![(StatusCode::OK, r#"{"ts":"21","updates":[[61,7]]}"#)]).await;

	let registry: Arc<MessageRegistry> = Arc::default();
	let options = MessageStreamOptions {
		mode: vk_longpoll::mode::ATTACHMENTS | vk_longpoll::mode::PTS,
		version: 3,
	};
	let mut lp = subscribe_messages(
		api(&fake, "tok"),
		TargetId::CURRENT_ACTOR,
		options,
		transport(),
		registry,
		BackoffConfig::none(),
	)
	.await
	.unwrap();
	assert_eq!(lp.session().protocol_version, 3);

	assert!(matches!(lp.run_cycle().await, CycleOutcome::Delivered { dispatched: 0, .. }));

	let acquisitions = fake.acquisitions.lock().clone();
	assert!(acquisitions[0].starts_with("/method/messages.getLongPollServer?"));
	assert!(acquisitions[0].contains("need_pts=1"));
	assert!(acquisitions[0].contains("lp_version=3"));
	assert!(!acquisitions[0].contains("group_id"));

	let polls = fake.polls.lock().clone();
	assert_eq!(polls[0], "act=a_check&key=k1&ts=10&wait=25&mode=34&version=3");
}

#[tokio::test]
async fn rejected_token_fails_subscription() {
	let fake = spawn_fake(vec![(StatusCode::OK, r#"{"ts":"1","updates":[]}"#)]).await;

	let result = subscribe_group(
		api(&fake, "bad"),
		TargetId::new(5),
		transport(),
		Arc::default(),
		BackoffConfig::none(),
	)
	.await;

	let Err(AcquisitionError::Api { source, .. }) = result else {
		panic!("expected api error");
	};
	assert_eq!(source.remote_code(), Some(5));
	assert!(fake.polls.lock().is_empty());
}
