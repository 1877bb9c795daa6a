use agent_gateway_error::GatewayError;
use serde::Deserialize;
use url::Url;

const AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const ACCESS_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const USER_URL: &str = "https://api.github.com/user";
const USER_AGENT: &str = concat!("agent-gateway/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    login: String,
}

/// GitHub OAuth web-flow client for the single allow-listed identity.
#[derive(Clone)]
pub struct IdentityClient {
    client_id: String,
    client_secret: String,
    allowed_user: String,
    redirect_uri: String,
    http: reqwest::Client,
}

impl IdentityClient {
    pub fn new(
        client_id: String,
        client_secret: String,
        allowed_user: String,
        public_url: &str,
    ) -> Self {
        Self {
            client_id,
            client_secret,
            allowed_user,
            redirect_uri: format!("{public_url}/api/auth/callback"),
            http: reqwest::Client::new(),
        }
    }

    pub fn authorize_url(&self, state: &str) -> String {
        let url = Url::parse_with_params(
            AUTHORIZE_URL,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("scope", "read:user"),
                ("state", state),
            ],
        )
        .expect("static authorize url is valid");
        url.to_string()
    }

    pub async fn exchange(&self, code: &str) -> Result<String, GatewayError> {
        let response = self
            .http
            .post(ACCESS_TOKEN_URL)
            .header("accept", "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|err| GatewayError::Internal {
                message: format!("identity exchange request failed: {err}"),
            })?;

        let status = response.status();
        let body: AccessTokenResponse =
            response.json().await.map_err(|err| GatewayError::Internal {
                message: format!("identity exchange response unreadable: {err}"),
            })?;
        match body.access_token {
            Some(token) => Ok(token),
            None => Err(GatewayError::AuthenticationFailed {
                message: Some(
                    body.error_description
                        .unwrap_or_else(|| format!("identity exchange returned {status}")),
                ),
            }),
        }
    }

    pub async fn fetch_login(&self, access_token: &str) -> Result<String, GatewayError> {
        let response = self
            .http
            .get(USER_URL)
            .header("user-agent", USER_AGENT)
            .header("accept", "application/vnd.github+json")
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|err| GatewayError::Internal {
                message: format!("identity lookup failed: {err}"),
            })?;
        if !response.status().is_success() {
            return Err(GatewayError::AuthenticationFailed {
                message: Some(format!("identity lookup returned {}", response.status())),
            });
        }
        let user: UserResponse = response.json().await.map_err(|err| GatewayError::Internal {
            message: format!("identity lookup response unreadable: {err}"),
        })?;
        Ok(user.login)
    }

    pub fn is_allowed(&self, login: &str) -> bool {
        login.eq_ignore_ascii_case(&self.allowed_user)
    }
}
