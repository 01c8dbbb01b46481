//! HTTP and WebSocket tests against an in-process server backed by a
//! scripted remote.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use liblidar::remote::RemoteError;
use liblidar::remote::scripted::{ScriptStats, ScriptedConnector, Step};
use liblidar::{RemoteConfig, TaskService, TemplateSet};
use lidar_protocol::{Event, EventKind, SubmitResponse, TaskInfo};
use lidar_web::auth::StaticToken;
use lidar_web::{AppState, build_cors, router};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

mod helpers {
    use super::*;

    pub struct TestServer {
        pub addr: SocketAddr,
        pub stats: Arc<ScriptStats>,
        pub client: reqwest::Client,
    }

    impl TestServer {
        pub fn url(&self, path: &str) -> String {
            format!("http://{}/api/lidar{path}", self.addr)
        }

        pub fn ws_url(&self, task_id: &str) -> String {
            format!("ws://{}/api/lidar/ws/{task_id}", self.addr)
        }

        pub async fn post(&self, path: &str, body: Value) -> (u16, Value) {
            let resp = self.client.post(self.url(path)).json(&body).send().await.unwrap();
            let status = resp.status().as_u16();
            (status, resp.json().await.unwrap_or(Value::Null))
        }

        pub async fn get(&self, path: &str) -> (u16, Value) {
            let resp = self.client.get(self.url(path)).send().await.unwrap();
            let status = resp.status().as_u16();
            (status, resp.json().await.unwrap_or(Value::Null))
        }
    }

    pub async fn start(connector: ScriptedConnector, token: Option<&str>) -> TestServer {
        let stats = connector.stats();
        let service = TaskService::new(
            Arc::new(connector),
            RemoteConfig::default(),
            TemplateSet::builtin(),
        )
        .with_poll_interval(Duration::from_millis(2));
        let state = AppState::new(service, Arc::new(StaticToken::new(token.map(String::from))));
        let app = router(state, build_cors(&["*".to_string()]).unwrap());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        TestServer {
            addr,
            stats,
            client: reqwest::Client::new(),
        }
    }

    /// Read event frames until the server closes the stream.
    pub async fn collect_events<R>(request: R) -> Vec<Event>
    where
        R: IntoClientRequest + Unpin,
    {
        let (mut ws, _) = connect_async(request).await.unwrap();
        let mut events = Vec::new();
        loop {
            let msg = timeout(Duration::from_secs(10), ws.next())
                .await
                .expect("timed out waiting for event frame");
            match msg {
                None | Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Text(text))) => {
                    events.push(serde_json::from_str(text.as_str()).unwrap());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => panic!("websocket error: {err}"),
            }
        }
        events
    }
}

use helpers::{collect_events, start};

fn scan_body() -> Value {
    json!({"scan_range": 240, "scan_step": 5, "lidar_duration": 10, "pulse_delay": "0.006"})
}

#[tokio::test]
async fn submitted_task_streams_in_order_and_closes() {
    let server = start(
        ScriptedConnector::new(vec![
            Step::out("Serial open\n"),
            Step::err("warning: slow\n"),
            Step::out("distance 1.25\n"),
            Step::Exit(Some(0)),
        ])
        .with_poll_delay(Duration::from_millis(5)),
        None,
    )
    .await;

    let (status, body) = server.post("/test", json!({})).await;
    assert_eq!(status, 200);
    let sub: SubmitResponse = serde_json::from_value(body).unwrap();
    assert_eq!(sub.filename, None);

    let events = collect_events(server.ws_url(&sub.task_id)).await;
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::Stdout, EventKind::Stderr, EventKind::Stdout, EventKind::Info]
    );
    assert_eq!(events[0].text, "Serial open\n");
    assert!(events[3].text.contains("exit=0"));

    let (status, body) = server.get(&format!("/tasks/{}", sub.task_id)).await;
    assert_eq!(status, 200);
    let info: TaskInfo = serde_json::from_value(body).unwrap();
    assert!(info.completed);
    assert_eq!(info.template, "lidar_test");
    assert!(info.command.ends_with("python lidar.py"));
}

#[tokio::test]
async fn start_scan_returns_filename_and_quotes_params() {
    let server = start(ScriptedConnector::new(vec![Step::Exit(Some(0))]), None).await;

    let (status, body) = server.post("/start", scan_body()).await;
    assert_eq!(status, 200);
    let filename = body["filename"].as_str().unwrap().to_string();
    assert!(filename.starts_with("scan_") && filename.ends_with(".txt"));

    let task_id = body["task_id"].as_str().unwrap();
    collect_events(server.ws_url(task_id)).await;
    let commands = server.stats.commands();
    assert!(commands[0].contains("--scan_range 240 --scan_step 5"));
    assert!(commands[0].ends_with(&format!("--filename scans/{filename}")));
}

#[tokio::test]
async fn validation_failures_allocate_no_task() {
    let server = start(ScriptedConnector::new(vec![Step::Exit(Some(0))]), None).await;

    let mut body = scan_body();
    body["scan_step"] = Value::Null;
    let (status, err) = server.post("/start", body).await;
    assert_eq!(status, 400);
    assert_eq!(err["code"], "missing_parameter");
    assert!(err["error"].as_str().unwrap().contains("scan_step"));

    let (status, err) = server.post("/tasks/format_disk", json!({})).await;
    assert_eq!(status, 404);
    assert_eq!(err["code"], "unknown_template");

    let (status, err) = server.post("/start", json!({"scan_range": [1, 2]})).await;
    assert_eq!(status, 400);
    assert_eq!(err["code"], "invalid_request");

    let (_, tasks) = server.get("/tasks").await;
    assert_eq!(tasks, json!([]));
    assert!(server.stats.commands().is_empty());
}

#[tokio::test]
async fn generic_submit_route_accepts_named_templates() {
    let server = start(ScriptedConnector::new(vec![Step::Exit(Some(0))]), None).await;
    let (status, body) = server.post("/tasks/engine_test", json!({})).await;
    assert_eq!(status, 200);
    collect_events(server.ws_url(body["task_id"].as_str().unwrap())).await;
    assert!(server.stats.commands()[0].ends_with("python engine.py"));
}

#[tokio::test]
async fn stop_interrupts_and_is_idempotent() {
    let server = start(ScriptedConnector::new(vec![Step::out("spinning\n"), Step::Hang]), None).await;

    let (status, err) = server.post("/stop", json!({"task_id": "nope"})).await;
    assert_eq!(status, 404);
    assert_eq!(err["code"], "task_not_found");

    let (_, body) = server.post("/engine_test", json!({})).await;
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let (mut ws, _) = connect_async(server.ws_url(&task_id)).await.unwrap();
    let first = timeout(Duration::from_secs(10), ws.next()).await.unwrap().unwrap().unwrap();
    let first: Event = serde_json::from_str(first.to_text().unwrap()).unwrap();
    assert_eq!(first, Event::stdout("spinning\n"));

    let (status, body) = server.post("/stop", json!({"task_id": task_id})).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"ok": true}));

    let mut last = None;
    while let Some(msg) = timeout(Duration::from_secs(10), ws.next()).await.unwrap() {
        match msg.unwrap() {
            Message::Text(text) => last = Some(serde_json::from_str::<Event>(text.as_str()).unwrap()),
            Message::Close(_) => break,
            _ => {}
        }
    }
    assert_eq!(last.unwrap(), Event::info("[!] interrupted by user"));

    let (status, _) = server.post("/stop", json!({"task_id": task_id})).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn unknown_task_stream_reports_and_closes() {
    let server = start(ScriptedConnector::new(vec![]), None).await;
    let events = collect_events(server.ws_url("does-not-exist")).await;
    assert_eq!(events, vec![Event::stderr("task not found")]);
}

#[tokio::test]
async fn late_subscriber_gets_buffered_events() {
    let server = start(
        ScriptedConnector::new(vec![Step::out("early\n"), Step::Exit(Some(2))]),
        None,
    )
    .await;
    let (_, body) = server.post("/test", json!({})).await;
    let task_id = body["task_id"].as_str().unwrap().to_string();

    for _ in 0..200 {
        let (_, info) = server.get(&format!("/tasks/{task_id}")).await;
        if info["completed"] == true {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let events = collect_events(server.ws_url(&task_id)).await;
    assert_eq!(events[0], Event::stdout("early\n"));
    assert!(events[1].text.contains("exit=2"));

    // Drained and completed: a second subscriber sees an empty stream.
    assert!(collect_events(server.ws_url(&task_id)).await.is_empty());
}

#[tokio::test]
async fn download_serves_artifacts_and_maps_failures() {
    let server = start(
        ScriptedConnector::new(vec![]).with_file(
            "/home/vr/Desktop/lidar/scans/scan_20240101_120000.txt",
            b"0.1 0.2 0.3\n".to_vec(),
        ),
        None,
    )
    .await;

    let resp = server
        .client
        .get(server.url("/download?filename=scan_20240101_120000.txt"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-disposition"],
        "attachment; filename=\"scan_20240101_120000.txt\""
    );
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"0.1 0.2 0.3\n");

    let (status, err) = server.get("/download?filename=scan_19990101_000000.txt").await;
    assert_eq!(status, 404);
    assert_eq!(err["code"], "artifact_not_found");

    let (status, err) = server.get("/download?filename=..%2F..%2Fetc%2Fpasswd").await;
    assert_eq!(status, 400);
    assert_eq!(err["code"], "invalid_filename");

    let (status, _) = server.get("/download").await;
    assert_eq!(status, 400);

    let broken = start(
        ScriptedConnector::new(vec![]).with_transfer_error(RemoteError::Transfer("eof".into())),
        None,
    )
    .await;
    let (status, err) = broken.get("/download?filename=scan_1.txt").await;
    assert_eq!(status, 502);
    assert_eq!(err["code"], "transfer_failed");
}

#[tokio::test]
async fn ping_checks_the_remote() {
    let up = start(ScriptedConnector::new(vec![Step::Exit(Some(0))]), None).await;
    let (status, body) = up.post("/ping", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"ok": true}));
    assert!(up.stats.commands()[0].ends_with("&& pwd"));

    let down = start(
        ScriptedConnector::failing(RemoteError::Connect("timed out".into())),
        None,
    )
    .await;
    let (status, err) = down.post("/ping", json!({})).await;
    assert_eq!(status, 502);
    assert_eq!(err["code"], "remote_unavailable");
}

#[tokio::test]
async fn connect_checks_the_remote_like_ping() {
    let up = start(ScriptedConnector::new(vec![Step::Exit(Some(0))]), Some("s3cret")).await;
    let (status, _) = up.post("/connect", json!({})).await;
    assert_eq!(status, 401);

    let resp = up
        .client
        .post(up.url("/connect"))
        .bearer_auth("s3cret")
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<serde_json::Value>().await.unwrap(), json!({"ok": true}));
    assert_eq!(up.stats.connects(), 1);
    assert!(up.stats.commands()[0].ends_with("&& pwd"));

    let down = start(
        ScriptedConnector::failing(RemoteError::Connect("no route to host".into())),
        None,
    )
    .await;
    let (status, err) = down.post("/connect", json!({})).await;
    assert_eq!(status, 502);
    assert_eq!(err["code"], "remote_unavailable");
}

#[tokio::test]
async fn token_is_required_when_configured() {
    let server = start(ScriptedConnector::new(vec![Step::Exit(Some(0))]), Some("s3cret")).await;

    let (status, err) = server.post("/test", json!({})).await;
    assert_eq!(status, 401);
    assert_eq!(err["code"], "unauthorized");

    let resp = server
        .client
        .post(server.url("/test"))
        .bearer_auth("s3cret")
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let sub: SubmitResponse = resp.json().await.unwrap();

    let err = connect_async(server.ws_url(&sub.task_id)).await.unwrap_err();
    assert!(matches!(
        err,
        tokio_tungstenite::tungstenite::Error::Http(ref resp) if resp.status() == 401
    ));

    let mut request = server.ws_url(&sub.task_id).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Cookie", "Authorization=Bearer%20s3cret".parse().unwrap());
    let events = collect_events(request).await;
    assert!(events.last().unwrap().text.contains("exit=0"));
}
