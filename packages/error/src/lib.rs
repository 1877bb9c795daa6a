use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Configuration,
    AuthenticationFailed,
    Forbidden,
    InvalidRequest,
    InvalidState,
    NoActiveSession,
    SetupIncomplete,
    TokenExchangeFailed,
    TokenRefreshFailed,
    AgentError,
    SandboxError,
    Timeout,
    Storage,
    Internal,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::Configuration => "urn:agent-gateway:error:configuration",
            Self::AuthenticationFailed => "urn:agent-gateway:error:authentication_failed",
            Self::Forbidden => "urn:agent-gateway:error:forbidden",
            Self::InvalidRequest => "urn:agent-gateway:error:invalid_request",
            Self::InvalidState => "urn:agent-gateway:error:invalid_state",
            Self::NoActiveSession => "urn:agent-gateway:error:no_active_session",
            Self::SetupIncomplete => "urn:agent-gateway:error:setup_incomplete",
            Self::TokenExchangeFailed => "urn:agent-gateway:error:token_exchange_failed",
            Self::TokenRefreshFailed => "urn:agent-gateway:error:token_refresh_failed",
            Self::AgentError => "urn:agent-gateway:error:agent_error",
            Self::SandboxError => "urn:agent-gateway:error:sandbox_error",
            Self::Timeout => "urn:agent-gateway:error:timeout",
            Self::Storage => "urn:agent-gateway:error:storage",
            Self::Internal => "urn:agent-gateway:error:internal",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Configuration => "Configuration Error",
            Self::AuthenticationFailed => "Authentication Failed",
            Self::Forbidden => "Forbidden",
            Self::InvalidRequest => "Invalid Request",
            Self::InvalidState => "Invalid State",
            Self::NoActiveSession => "No Active Session",
            Self::SetupIncomplete => "Setup Incomplete",
            Self::TokenExchangeFailed => "Token Exchange Failed",
            Self::TokenRefreshFailed => "Token Refresh Failed",
            Self::AgentError => "Agent Error",
            Self::SandboxError => "Sandbox Error",
            Self::Timeout => "Timeout",
            Self::Storage => "Storage Error",
            Self::Internal => "Internal Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Configuration => 500,
            Self::AuthenticationFailed => 401,
            Self::Forbidden => 403,
            Self::InvalidRequest => 400,
            Self::InvalidState => 409,
            Self::NoActiveSession => 409,
            Self::SetupIncomplete => 400,
            Self::TokenExchangeFailed => 502,
            Self::TokenRefreshFailed => 502,
            Self::AgentError => 500,
            Self::SandboxError => 500,
            Self::Timeout => 504,
            Self::Storage => 500,
            Self::Internal => 500,
        }
    }
}

/// RFC 7807 problem document returned by every REST error path.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("authentication failed")]
    AuthenticationFailed { message: Option<String> },
    #[error("identity not allowed: {login}")]
    Forbidden { login: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("operation not permitted in state {state}")]
    InvalidState { state: String },
    #[error("no active session")]
    NoActiveSession,
    #[error("setup incomplete: {message}")]
    SetupIncomplete { message: String },
    #[error("token exchange failed with status {status}")]
    TokenExchangeFailed { status: u16, body: String },
    #[error("token refresh failed with status {status}")]
    TokenRefreshFailed { status: u16, body: String },
    #[error("agent error: {message}")]
    Agent { message: String },
    #[error("sandbox error: {message}")]
    Sandbox { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Configuration { .. } => ErrorType::Configuration,
            Self::AuthenticationFailed { .. } => ErrorType::AuthenticationFailed,
            Self::Forbidden { .. } => ErrorType::Forbidden,
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::InvalidState { .. } => ErrorType::InvalidState,
            Self::NoActiveSession => ErrorType::NoActiveSession,
            Self::SetupIncomplete { .. } => ErrorType::SetupIncomplete,
            Self::TokenExchangeFailed { .. } => ErrorType::TokenExchangeFailed,
            Self::TokenRefreshFailed { .. } => ErrorType::TokenRefreshFailed,
            Self::Agent { .. } => ErrorType::AgentError,
            Self::Sandbox { .. } => ErrorType::SandboxError,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Storage { .. } => ErrorType::Storage,
            Self::Internal { .. } => ErrorType::Internal,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let mut extensions = Map::new();
        match self {
            Self::TokenExchangeFailed { status, body }
            | Self::TokenRefreshFailed { status, body } => {
                extensions.insert("upstreamStatus".to_string(), Value::from(*status));
                if !body.is_empty() {
                    extensions.insert("upstreamBody".to_string(), Value::String(body.clone()));
                }
            }
            Self::InvalidState { state } => {
                extensions.insert("state".to_string(), Value::String(state.clone()));
            }
            Self::Forbidden { login } => {
                extensions.insert("login".to_string(), Value::String(login.clone()));
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<GatewayError> for ProblemDetails {
    fn from(value: GatewayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&GatewayError> for ProblemDetails {
    fn from(value: &GatewayError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(ErrorType::AuthenticationFailed.status_code(), 401);
        assert_eq!(ErrorType::InvalidState.status_code(), 409);
        assert_eq!(ErrorType::SetupIncomplete.status_code(), 400);
        assert_eq!(ErrorType::Timeout.status_code(), 504);
    }

    #[test]
    fn problem_details_carry_upstream_status() {
        let err = GatewayError::TokenExchangeFailed {
            status: 403,
            body: "denied".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 502);
        assert_eq!(
            problem.extensions.get("upstreamStatus"),
            Some(&Value::from(403))
        );
    }

    #[test]
    fn problem_details_serialize_flat() {
        let err = GatewayError::InvalidState {
            state: "running".to_string(),
        };
        let json = serde_json::to_value(err.to_problem_details()).unwrap();
        assert_eq!(json["status"], 409);
        assert_eq!(json["state"], "running");
    }
}
