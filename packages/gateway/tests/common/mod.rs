#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::util::ServiceExt;

use agent_gateway::config::EnvConfig;
use agent_gateway::router::{build_router, AppState};
use agent_gateway::store::ConfigStore;

pub const SECRET: &str = "integration-test-secret-0123456789abcdef";
pub const KEY_HEX: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0";

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
    _data_dir: TempDir,
}

impl TestApp {
    pub fn new() -> Self {
        Self::build(|state| state)
    }

    /// Builds the app with a chance to swap collaborators (e.g. the OAuth
    /// client) before the router captures the state.
    pub fn build(customize: impl FnOnce(AppState) -> AppState) -> Self {
        let data_dir = tempfile::tempdir().expect("create temp data dir");
        let config = test_config(data_dir.path());
        let store = ConfigStore::open_memory().expect("open store");
        let state = AppState::new(config, store).expect("build app state");
        let state = Arc::new(customize(state));
        let app = build_router(state.clone());
        Self {
            app,
            state,
            _data_dir: data_dir,
        }
    }

    pub fn session_cookie(&self) -> String {
        format!("gateway_session={}", self.state.cookies.issue())
    }

    pub fn mark_setup_complete(&self) {
        self.state
            .store
            .set("setup_complete", "true")
            .expect("set setup flag");
    }
}

pub fn test_config(data_dir: &Path) -> EnvConfig {
    EnvConfig {
        secret: SECRET.to_string(),
        encryption_key_hex: KEY_HEX.to_string(),
        github_client_id: "test-client-id".to_string(),
        github_client_secret: "test-client-secret".to_string(),
        allowed_user: "octocat".to_string(),
        public_url: "https://gateway.test".to_string(),
        port: 3000,
        data_dir: data_dir.to_path_buf(),
        wrapper_path: data_dir.join("agent-wrapper.sh"),
        sandbox_container: None,
        sandbox_image: "agent-sandbox:latest".to_string(),
        ws_path: "/ws".to_string(),
    }
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
    cookie: Option<&str>,
) -> (StatusCode, Value, axum::http::HeaderMap) {
    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json");
    if let Some(cookie) = cookie {
        request = request.header("cookie", cookie);
    }
    let request = request
        .body(Body::from(
            body.map(|value| value.to_string()).unwrap_or_default(),
        ))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let payload = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, payload, headers)
}

/// Writes an executable mock agent script speaking the stream-json protocol.
#[cfg(unix)]
pub fn write_mock_agent(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write mock agent");
    let mut perms = std::fs::metadata(&path).expect("stat mock agent").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod mock agent");
    path
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let payload = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed");
    serde_json::from_str(&payload).expect("event is json")
}

pub async fn wait_for_event(rx: &mut mpsc::UnboundedReceiver<String>, event_type: &str) -> Value {
    loop {
        let event = next_event(rx).await;
        if event["type"] == event_type {
            return event;
        }
    }
}

pub async fn wait_for_state(rx: &mut mpsc::UnboundedReceiver<String>, state: &str) -> Value {
    loop {
        let event = wait_for_event(rx, "session_state").await;
        if event["state"] == state {
            return event;
        }
    }
}
