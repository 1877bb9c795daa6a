//! OAuth PKCE client for the upstream assistant service, plus encrypted
//! persistence of the resulting tokens in the config store.

use agent_gateway_error::GatewayError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use url::Url;

use crate::crypto::TokenCipher;
use crate::store::{keys, ConfigStore};

pub const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
pub const DEFAULT_REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";
pub const DEFAULT_SCOPE: &str = "org:create_api_key user:profile user:inference";
const AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";
const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";

/// Default access-token lifetime when the upstream omits `expires_in`.
const DEFAULT_EXPIRES_IN: Duration = Duration::hours(8);
/// Tokens within this much of expiry are refreshed before session start.
pub const REFRESH_THRESHOLD: Duration = Duration::minutes(30);

#[derive(Debug, Clone, PartialEq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    pub refreshed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub fn generate_code_verifier() -> String {
    let mut raw = [0u8; 32];
    OsRng.fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

pub fn generate_code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

pub fn generate_state() -> String {
    let mut raw = [0u8; 24];
    OsRng.fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

#[derive(Debug, Default)]
pub struct AuthorizeOverrides<'a> {
    pub client_id: Option<&'a str>,
    pub redirect_uri: Option<&'a str>,
    pub scope: Option<&'a str>,
}

pub fn build_authorization_url(
    code_challenge: &str,
    state: &str,
    overrides: AuthorizeOverrides<'_>,
) -> String {
    let url = Url::parse_with_params(
        AUTHORIZE_URL,
        &[
            ("code", "true"),
            ("response_type", "code"),
            ("client_id", overrides.client_id.unwrap_or(DEFAULT_CLIENT_ID)),
            (
                "redirect_uri",
                overrides.redirect_uri.unwrap_or(DEFAULT_REDIRECT_URI),
            ),
            ("scope", overrides.scope.unwrap_or(DEFAULT_SCOPE)),
            ("code_challenge", code_challenge),
            ("code_challenge_method", "S256"),
            ("state", state),
        ],
    )
    .expect("static authorize url is valid");
    url.to_string()
}

/// True when the token is absent, already expired, or inside the refresh
/// threshold.
pub fn needs_refresh(
    expires_at: Option<OffsetDateTime>,
    threshold: Duration,
    now: OffsetDateTime,
) -> bool {
    match expires_at {
        None => true,
        Some(expires_at) => expires_at - now < threshold,
    }
}

/// Splits the pasted `<code>#<state>` artifact from the upstream callback
/// page. Input is trimmed first; without a `#` the whole value is the code.
pub fn split_code_state(raw: &str) -> (String, Option<String>) {
    let trimmed = raw.trim();
    match trimmed.split_once('#') {
        Some((code, state)) => (code.to_string(), Some(state.to_string())),
        None => (trimmed.to_string(), None),
    }
}

#[derive(Clone)]
pub struct OauthClient {
    http: reqwest::Client,
    token_url: String,
}

impl OauthClient {
    pub fn new() -> Self {
        Self::with_token_url(TOKEN_URL.to_string())
    }

    /// Token endpoint override, used by tests against a local upstream.
    pub fn with_token_url(token_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url,
        }
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        state: Option<&str>,
    ) -> Result<TokenSet, GatewayError> {
        let mut body = serde_json::json!({
            "grant_type": "authorization_code",
            "code": code,
            "client_id": DEFAULT_CLIENT_ID,
            "redirect_uri": DEFAULT_REDIRECT_URI,
            "code_verifier": verifier,
        });
        if let Some(state) = state {
            body["state"] = serde_json::Value::String(state.to_string());
        }

        let response = self
            .http
            .post(&self.token_url)
            .json(&body)
            .send()
            .await
            .map_err(|err| GatewayError::TokenExchangeFailed {
                status: 0,
                body: err.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::TokenExchangeFailed {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: TokenResponse =
            response
                .json()
                .await
                .map_err(|err| GatewayError::TokenExchangeFailed {
                    status: status.as_u16(),
                    body: err.to_string(),
                })?;
        Ok(token_set_from_response(parsed, None, OffsetDateTime::now_utc()))
    }

    pub async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenSet, GatewayError> {
        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": DEFAULT_CLIENT_ID,
        });

        let response = self
            .http
            .post(&self.token_url)
            .json(&body)
            .send()
            .await
            .map_err(|err| GatewayError::TokenRefreshFailed {
                status: 0,
                body: err.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::TokenRefreshFailed {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: TokenResponse =
            response
                .json()
                .await
                .map_err(|err| GatewayError::TokenRefreshFailed {
                    status: status.as_u16(),
                    body: err.to_string(),
                })?;
        Ok(token_set_from_response(
            parsed,
            Some(refresh_token),
            OffsetDateTime::now_utc(),
        ))
    }
}

impl Default for OauthClient {
    fn default() -> Self {
        Self::new()
    }
}

fn token_set_from_response(
    response: TokenResponse,
    previous_refresh: Option<&str>,
    now: OffsetDateTime,
) -> TokenSet {
    let expires_in = response
        .expires_in
        .map(Duration::seconds)
        .unwrap_or(DEFAULT_EXPIRES_IN);
    TokenSet {
        access_token: response.access_token,
        // Some upstreams omit the rotated refresh token; keep the old one.
        refresh_token: response
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string)),
        expires_at: Some(now + expires_in),
        refreshed_at: Some(now),
    }
}

/// Loads the persisted token record, decrypting the sensitive entries.
/// Returns `None` when no access token has been stored yet.
pub fn load_tokens(
    store: &ConfigStore,
    cipher: &TokenCipher,
) -> Result<Option<TokenSet>, GatewayError> {
    let Some(access_encrypted) = store.get(keys::OAUTH_TOKEN).map_err(storage_err)? else {
        return Ok(None);
    };
    let access_token = cipher
        .decrypt(&access_encrypted)
        .map_err(|err| GatewayError::AuthenticationFailed {
            message: Some(err.to_string()),
        })?;

    let refresh_token = match store.get(keys::REFRESH_TOKEN).map_err(storage_err)? {
        Some(encrypted) => {
            Some(
                cipher
                    .decrypt(&encrypted)
                    .map_err(|err| GatewayError::AuthenticationFailed {
                        message: Some(err.to_string()),
                    })?,
            )
        }
        None => None,
    };

    let expires_at = store
        .get(keys::TOKEN_EXPIRES_AT)
        .map_err(storage_err)?
        .and_then(|value| OffsetDateTime::parse(&value, &Rfc3339).ok());
    let refreshed_at = store
        .get(keys::TOKEN_REFRESHED_AT)
        .map_err(storage_err)?
        .and_then(|value| OffsetDateTime::parse(&value, &Rfc3339).ok())
        .or(expires_at);

    Ok(Some(TokenSet {
        access_token,
        refresh_token,
        expires_at,
        refreshed_at,
    }))
}

/// Encrypts and persists a token record.
pub fn store_tokens(
    store: &ConfigStore,
    cipher: &TokenCipher,
    tokens: &TokenSet,
) -> Result<(), GatewayError> {
    let access_encrypted =
        cipher
            .encrypt(&tokens.access_token)
            .map_err(|err| GatewayError::Internal {
                message: format!("token encryption failed: {err}"),
            })?;
    store
        .set(keys::OAUTH_TOKEN, &access_encrypted)
        .map_err(storage_err)?;

    match &tokens.refresh_token {
        Some(refresh) => {
            let encrypted = cipher.encrypt(refresh).map_err(|err| GatewayError::Internal {
                message: format!("token encryption failed: {err}"),
            })?;
            store
                .set(keys::REFRESH_TOKEN, &encrypted)
                .map_err(storage_err)?;
        }
        None => store.delete(keys::REFRESH_TOKEN).map_err(storage_err)?,
    }

    match tokens.expires_at {
        Some(expires_at) => store
            .set(
                keys::TOKEN_EXPIRES_AT,
                &expires_at.format(&Rfc3339).map_err(|err| GatewayError::Internal {
                    message: format!("timestamp formatting failed: {err}"),
                })?,
            )
            .map_err(storage_err)?,
        None => store.delete(keys::TOKEN_EXPIRES_AT).map_err(storage_err)?,
    }
    match tokens.refreshed_at {
        Some(refreshed_at) => store
            .set(
                keys::TOKEN_REFRESHED_AT,
                &refreshed_at.format(&Rfc3339).map_err(|err| GatewayError::Internal {
                    message: format!("timestamp formatting failed: {err}"),
                })?,
            )
            .map_err(storage_err)?,
        None => store.delete(keys::TOKEN_REFRESHED_AT).map_err(storage_err)?,
    }
    Ok(())
}

fn storage_err(err: crate::store::StoreError) -> GatewayError {
    GatewayError::Storage {
        message: err.to_string(),
    }
}
