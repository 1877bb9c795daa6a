//! Setup-time code exchange against a local stand-in token endpoint.

mod common;

use axum::http::{Method, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use agent_gateway::oauth::{self, OauthClient};
use agent_gateway_error::GatewayError;

use common::{send_json, TestApp};

async fn spawn_token_endpoint(response: Value, status: StatusCode) -> String {
    let app = Router::new().route(
        "/v1/oauth/token",
        post(move || {
            let response = response.clone();
            async move { (status, Json(response)) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind token endpoint");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/v1/oauth/token")
}

#[tokio::test]
async fn exchange_round_trip_persists_tokens_and_clears_pending_state() {
    let token_url = spawn_token_endpoint(
        json!({
            "access_token": "sk-ant-oat01-granted",
            "refresh_token": "sk-ant-ort01-granted",
            "expires_in": 28800,
        }),
        StatusCode::OK,
    )
    .await;

    let app = TestApp::build(|mut state| {
        state.oauth = OauthClient::with_token_url(token_url);
        state
    });
    let cookie = app.session_cookie();

    let (status, body, _) = send_json(
        &app.app,
        Method::GET,
        "/api/setup/claude/start",
        None,
        Some(&cookie),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["url"].as_str().unwrap().contains("code_challenge="));

    let (status, body, _) = send_json(
        &app.app,
        Method::POST,
        "/api/setup/claude/exchange",
        Some(json!({"code": "codeX#stateY"})),
        Some(&cookie),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    assert_eq!(
        app.state.store.get("setup_complete").unwrap().as_deref(),
        Some("true")
    );
    assert_eq!(app.state.store.get("oauth_pending_state").unwrap(), None);
    assert_eq!(app.state.store.get("oauth_pending_verifier").unwrap(), None);

    let tokens = oauth::load_tokens(&app.state.store, &app.state.cipher)
        .unwrap()
        .unwrap();
    assert_eq!(tokens.access_token, "sk-ant-oat01-granted");
    assert_eq!(tokens.refresh_token.as_deref(), Some("sk-ant-ort01-granted"));
    assert!(tokens.expires_at.is_some());
}

#[tokio::test]
async fn failed_exchange_surfaces_upstream_status() {
    let token_url =
        spawn_token_endpoint(json!({"error": "invalid_grant"}), StatusCode::FORBIDDEN).await;
    let client = OauthClient::with_token_url(token_url);
    let err = client
        .exchange_code("bad-code", "verifier", None)
        .await
        .expect_err("exchange must fail");
    match err {
        GatewayError::TokenExchangeFailed { status, .. } => assert_eq!(status, 403),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn refresh_keeps_previous_refresh_token_when_upstream_omits_it() {
    let token_url = spawn_token_endpoint(
        json!({"access_token": "sk-ant-oat01-rotated", "expires_in": 28800}),
        StatusCode::OK,
    )
    .await;
    let client = OauthClient::with_token_url(token_url);
    let tokens = client
        .refresh_access_token("sk-ant-ort01-original")
        .await
        .expect("refresh");
    assert_eq!(tokens.access_token, "sk-ant-oat01-rotated");
    assert_eq!(
        tokens.refresh_token.as_deref(),
        Some("sk-ant-ort01-original")
    );
}

#[tokio::test]
async fn failed_refresh_surfaces_upstream_status() {
    let token_url =
        spawn_token_endpoint(json!({"error": "server_error"}), StatusCode::INTERNAL_SERVER_ERROR)
            .await;
    let client = OauthClient::with_token_url(token_url);
    let err = client
        .refresh_access_token("sk-ant-ort01-original")
        .await
        .expect_err("refresh must fail");
    assert!(matches!(
        err,
        GatewayError::TokenRefreshFailed { status: 500, .. }
    ));
}
