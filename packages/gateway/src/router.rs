use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_gateway_error::{GatewayError, ProblemDetails};
use axum::extract::{Query, Request, State};
use axum::http::header::{LOCATION, SET_COOKIE};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{OpenApi, ToSchema};

use crate::auth::cookie::{cookie_from_header, set_cookie_header, CookieSigner, COOKIE_NAME};
use crate::auth::github::IdentityClient;
use crate::auth::ticket::TicketIssuer;
use crate::config::EnvConfig;
use crate::crypto::TokenCipher;
use crate::health::{self, HealthResponse, MonitorResponse};
use crate::logbuf::{DebugRing, LogEntry};
use crate::oauth::{self, AuthorizeOverrides, OauthClient};
use crate::sandbox::SandboxControl;
use crate::session::SessionManager;
use crate::store::{keys, ConfigStore};
use crate::{ui, ws};

/// Conservative validity assumed for a manually pasted API token.
const MANUAL_TOKEN_VALIDITY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub struct AppState {
    pub config: EnvConfig,
    pub store: Arc<ConfigStore>,
    pub cipher: TokenCipher,
    pub cookies: CookieSigner,
    pub tickets: TicketIssuer,
    pub identity: IdentityClient,
    pub oauth: OauthClient,
    pub sandbox: Option<SandboxControl>,
    pub sessions: Arc<SessionManager>,
    pub log: Arc<DebugRing>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: EnvConfig, store: ConfigStore) -> Result<Self, GatewayError> {
        let store = Arc::new(store);
        let cipher = TokenCipher::from_hex(&config.encryption_key_hex).map_err(|err| {
            GatewayError::Configuration {
                message: err.to_string(),
            }
        })?;
        let cookies =
            CookieSigner::new(&config.secret).map_err(|err| GatewayError::Configuration {
                message: err.to_string(),
            })?;
        let tickets =
            TicketIssuer::new(&config.secret).map_err(|err| GatewayError::Configuration {
                message: err.to_string(),
            })?;
        let identity = IdentityClient::new(
            config.github_client_id.clone(),
            config.github_client_secret.clone(),
            config.allowed_user.clone(),
            &config.public_url,
        );
        let sandbox = config
            .sandbox_container
            .clone()
            .map(|container| SandboxControl::new(container, config.sandbox_image.clone()));
        let log = Arc::new(DebugRing::new());
        let sessions = Arc::new(SessionManager::new(store.clone(), log.clone()));
        Ok(Self {
            config,
            store,
            cipher,
            cookies,
            tickets,
            identity,
            oauth: OauthClient::new(),
            sandbox,
            sessions,
            log,
            started_at: Instant::now(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Gateway(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        get_monitor,
        get_session,
        delete_session,
        get_ws_ticket,
        setup_claude_token,
        setup_claude_start,
        setup_claude_exchange,
        get_debug,
        delete_debug
    ),
    components(schemas(
        HealthResponse,
        MonitorResponse,
        SessionStateResponse,
        OkResponse,
        TicketResponse,
        UrlResponse,
        SetupTokenRequest,
        SetupExchangeRequest,
        LogEntry,
        ProblemDetails
    )),
    tags(
        (name = "meta", description = "Health and monitoring"),
        (name = "session", description = "Agent session control"),
        (name = "setup", description = "Assistant credential setup")
    )
)]
pub struct ApiDoc;

pub fn build_router(shared: Arc<AppState>) -> Router {
    let setup_router = Router::new()
        .route("/setup", get(ui::setup_page))
        .route("/api/setup/claude/token", post(setup_claude_token))
        .route("/api/setup/claude/start", get(setup_claude_start))
        .route("/api/setup/claude/exchange", post(setup_claude_exchange))
        .with_state(shared.clone());

    let gated = Router::new()
        .route("/", get(ui::index_page))
        .route("/api/session", get(get_session).delete(delete_session))
        .route("/api/ws-ticket", get(get_ws_ticket))
        .route("/api/monitor", get(get_monitor))
        .route("/api/debug", get(get_debug).delete(delete_debug))
        .route("/api/openapi.json", get(openapi_json))
        .layer(middleware::from_fn_with_state(
            shared.clone(),
            require_setup,
        ))
        .with_state(shared.clone());

    let authed = setup_router.merge(gated).layer(middleware::from_fn_with_state(
        shared.clone(),
        require_session,
    ));

    let router = Router::new()
        .route("/login", get(ui::login_page))
        .route("/api/health", get(get_health))
        .route("/api/auth/github", post(auth_github_start))
        .route("/api/auth/callback", get(auth_github_callback))
        .route(&shared.config.ws_path, any(ws::ws_route))
        .with_state(shared.clone())
        .merge(authed);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri()
            )
        })
        .on_response(
            |response: &axum::http::Response<axum::body::Body>,
             latency: std::time::Duration,
             span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %response.status(),
                    latency_ms = latency.as_millis()
                );
            },
        );
    router.layer(trace_layer)
}

fn authenticated(state: &AppState, request: &Request) -> bool {
    request
        .headers()
        .get("cookie")
        .and_then(|value| value.to_str().ok())
        .and_then(|header| cookie_from_header(header, COOKIE_NAME))
        .and_then(|value| state.cookies.verify(&value))
        .is_some()
}

async fn require_session(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if authenticated(&state, &request) {
        return next.run(request).await;
    }
    let original = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let encoded: String = url::form_urlencoded::byte_serialize(original.as_bytes()).collect();
    (
        StatusCode::FOUND,
        [(LOCATION, format!("/login?return_to={encoded}"))],
    )
        .into_response()
}

async fn require_setup(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let complete = state
        .store
        .get(keys::SETUP_COMPLETE)
        .ok()
        .flatten()
        .as_deref()
        == Some("true");
    if complete {
        return next.run(request).await;
    }
    (StatusCode::FOUND, [(LOCATION, "/setup".to_string())]).into_response()
}

#[derive(Debug, Serialize, ToSchema)]
struct SessionStateResponse {
    state: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct OkResponse {
    ok: bool,
}

#[derive(Debug, Serialize, ToSchema)]
struct TicketResponse {
    ticket: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct UrlResponse {
    url: String,
}

#[derive(Debug, Deserialize, ToSchema)]
struct SetupTokenRequest {
    token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
struct SetupExchangeRequest {
    code: String,
}

#[derive(Debug, Deserialize)]
struct DebugQuery {
    limit: Option<usize>,
}

#[utoipa::path(get, path = "/api/health", tag = "meta",
    responses((status = 200, body = HealthResponse), (status = 503, body = HealthResponse)))]
async fn get_health(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = health::snapshot(&state).await;
    let status = if snapshot.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot)).into_response()
}

#[utoipa::path(get, path = "/api/monitor", tag = "meta",
    responses((status = 200, body = MonitorResponse)))]
async fn get_monitor(State(state): State<Arc<AppState>>) -> Json<MonitorResponse> {
    Json(health::monitor_snapshot(&state).await)
}

#[utoipa::path(get, path = "/api/session", tag = "session",
    responses((status = 200, body = SessionStateResponse)))]
async fn get_session(State(state): State<Arc<AppState>>) -> Json<SessionStateResponse> {
    Json(SessionStateResponse {
        state: state.sessions.phase().await.as_str().to_string(),
    })
}

#[utoipa::path(delete, path = "/api/session", tag = "session",
    responses((status = 200, body = OkResponse)))]
async fn delete_session(State(state): State<Arc<AppState>>) -> Json<OkResponse> {
    state.sessions.interrupt().await;
    Json(OkResponse { ok: true })
}

#[utoipa::path(get, path = "/api/ws-ticket", tag = "session",
    responses((status = 200, body = TicketResponse)))]
async fn get_ws_ticket(State(state): State<Arc<AppState>>) -> Json<TicketResponse> {
    Json(TicketResponse {
        ticket: state.tickets.issue(OffsetDateTime::now_utc()),
    })
}

#[utoipa::path(post, path = "/api/setup/claude/token", tag = "setup",
    request_body = SetupTokenRequest,
    responses((status = 200, body = OkResponse), (status = 400, body = ProblemDetails)))]
async fn setup_claude_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetupTokenRequest>,
) -> Result<Response, ApiError> {
    let token = body.token.trim();
    if !token.starts_with("sk-ant-") {
        return Err(GatewayError::InvalidRequest {
            message: "token must start with sk-ant-".to_string(),
        }
        .into());
    }

    let now = OffsetDateTime::now_utc();
    let tokens = oauth::TokenSet {
        access_token: token.to_string(),
        refresh_token: None,
        expires_at: Some(now + MANUAL_TOKEN_VALIDITY),
        refreshed_at: Some(now),
    };
    oauth::store_tokens(&state.store, &state.cipher, &tokens)?;
    state
        .store
        .set(keys::SETUP_COMPLETE, "true")
        .map_err(storage_err)?;
    state.log.push("setup.token_stored", "manual token configured", None);

    let cookie = state.cookies.issue();
    Ok((
        [(SET_COOKIE, set_cookie_header(&cookie))],
        Json(OkResponse { ok: true }),
    )
        .into_response())
}

#[utoipa::path(get, path = "/api/setup/claude/start", tag = "setup",
    responses((status = 200, body = UrlResponse)))]
async fn setup_claude_start(
    State(state): State<Arc<AppState>>,
) -> Result<Json<UrlResponse>, ApiError> {
    let verifier = oauth::generate_code_verifier();
    let challenge = oauth::generate_code_challenge(&verifier);
    let oauth_state = oauth::generate_state();
    state
        .store
        .set(keys::OAUTH_PENDING_STATE, &oauth_state)
        .map_err(storage_err)?;
    state
        .store
        .set(keys::OAUTH_PENDING_VERIFIER, &verifier)
        .map_err(storage_err)?;
    let url =
        oauth::build_authorization_url(&challenge, &oauth_state, AuthorizeOverrides::default());
    Ok(Json(UrlResponse { url }))
}

#[utoipa::path(post, path = "/api/setup/claude/exchange", tag = "setup",
    request_body = SetupExchangeRequest,
    responses((status = 200, body = OkResponse), (status = 400, body = ProblemDetails)))]
async fn setup_claude_exchange(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetupExchangeRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let verifier = state
        .store
        .get(keys::OAUTH_PENDING_VERIFIER)
        .map_err(storage_err)?
        .ok_or_else(|| GatewayError::InvalidRequest {
            message: "no pending authorization; start setup again".to_string(),
        })?;

    let (code, code_state) = oauth::split_code_state(&body.code);
    let tokens = state
        .oauth
        .exchange_code(&code, &verifier, code_state.as_deref())
        .await?;
    oauth::store_tokens(&state.store, &state.cipher, &tokens)?;
    state
        .store
        .set(keys::SETUP_COMPLETE, "true")
        .map_err(storage_err)?;
    state
        .store
        .delete(keys::OAUTH_PENDING_STATE)
        .map_err(storage_err)?;
    state
        .store
        .delete(keys::OAUTH_PENDING_VERIFIER)
        .map_err(storage_err)?;
    state.log.push("setup.exchange_complete", "oauth tokens stored", None);
    Ok(Json(OkResponse { ok: true }))
}

#[derive(Debug, Deserialize)]
struct AuthStartQuery {
    return_to: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingIdentity {
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    return_to: Option<String>,
}

async fn auth_github_start(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuthStartQuery>,
) -> Result<Json<UrlResponse>, ApiError> {
    let csrf = oauth::generate_state();
    let pending = PendingIdentity {
        state: csrf.clone(),
        return_to: query.return_to.filter(|target| target.starts_with('/')),
    };
    let encoded = serde_json::to_string(&pending).map_err(|err| GatewayError::Internal {
        message: err.to_string(),
    })?;
    state
        .store
        .set(keys::IDENTITY_PENDING_STATE, &encoded)
        .map_err(storage_err)?;
    Ok(Json(UrlResponse {
        url: state.identity.authorize_url(&csrf),
    }))
}

#[derive(Debug, Deserialize)]
struct AuthCallbackQuery {
    code: String,
    state: Option<String>,
}

async fn auth_github_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuthCallbackQuery>,
) -> Result<Response, ApiError> {
    let pending = state
        .store
        .get(keys::IDENTITY_PENDING_STATE)
        .map_err(storage_err)?
        .and_then(|raw| serde_json::from_str::<PendingIdentity>(&raw).ok())
        .ok_or(GatewayError::AuthenticationFailed {
            message: Some("no sign-in in progress".to_string()),
        })?;
    state
        .store
        .delete(keys::IDENTITY_PENDING_STATE)
        .map_err(storage_err)?;
    if query.state.as_deref() != Some(pending.state.as_str()) {
        return Err(GatewayError::AuthenticationFailed {
            message: Some("state mismatch".to_string()),
        }
        .into());
    }

    let access_token = state.identity.exchange(&query.code).await?;
    let login = state.identity.fetch_login(&access_token).await?;
    if !state.identity.is_allowed(&login) {
        state.log.push("auth.denied", &login, None);
        return Err(GatewayError::Forbidden { login }.into());
    }

    state.log.push("auth.signed_in", &login, None);
    let cookie = state.cookies.issue();
    let target = pending.return_to.unwrap_or_else(|| "/".to_string());
    Ok((
        StatusCode::FOUND,
        [
            (LOCATION, target),
            (SET_COOKIE, set_cookie_header(&cookie)),
        ],
    )
        .into_response())
}

#[utoipa::path(get, path = "/api/debug", tag = "meta",
    responses((status = 200, body = [LogEntry])))]
async fn get_debug(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DebugQuery>,
) -> Json<Vec<LogEntry>> {
    Json(state.log.get(query.limit))
}

#[utoipa::path(delete, path = "/api/debug", tag = "meta",
    responses((status = 200, body = OkResponse)))]
async fn delete_debug(State(state): State<Arc<AppState>>) -> Json<OkResponse> {
    state.log.clear();
    Json(OkResponse { ok: true })
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

fn storage_err(err: crate::store::StoreError) -> GatewayError {
    GatewayError::Storage {
        message: err.to_string(),
    }
}
