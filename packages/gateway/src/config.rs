use std::path::PathBuf;

use thiserror::Error;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_WS_PATH: &str = "/ws";
const DEFAULT_SANDBOX_IMAGE: &str = "agent-sandbox:latest";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("invalid environment variable {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Process configuration resolved from the environment at startup.
///
/// Missing required variables are reported together so the operator sees the
/// complete list on the first failed start.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub secret: String,
    pub encryption_key_hex: String,
    pub github_client_id: String,
    pub github_client_secret: String,
    pub allowed_user: String,
    pub public_url: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub wrapper_path: PathBuf,
    pub sandbox_container: Option<String>,
    pub sandbox_image: String,
    pub ws_path: String,
}

impl EnvConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut missing = Vec::new();
        let secret = required("GATEWAY_SECRET", &mut missing);
        let encryption_key_hex = required("GATEWAY_ENCRYPTION_KEY", &mut missing);
        let github_client_id = required("GITHUB_CLIENT_ID", &mut missing);
        let github_client_secret = required("GITHUB_CLIENT_SECRET", &mut missing);
        let allowed_user = required("GATEWAY_ALLOWED_USER", &mut missing);
        let public_url = required("GATEWAY_PUBLIC_URL", &mut missing);
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let secret = secret.unwrap_or_default();
        if secret.len() < 32 {
            return Err(ConfigError::Invalid {
                name: "GATEWAY_SECRET".to_string(),
                reason: "must be at least 32 characters".to_string(),
            });
        }
        let encryption_key_hex = encryption_key_hex.unwrap_or_default();
        if encryption_key_hex.len() != 64
            || !encryption_key_hex.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(ConfigError::Invalid {
                name: "GATEWAY_ENCRYPTION_KEY".to_string(),
                reason: "must be 64 hex characters (a 32-byte key)".to_string(),
            });
        }

        let port = match std::env::var("PORT") {
            Ok(value) => value.parse::<u16>().map_err(|_| ConfigError::Invalid {
                name: "PORT".to_string(),
                reason: format!("not a valid port: {value}"),
            })?,
            Err(_) => DEFAULT_PORT,
        };

        let data_dir = std::env::var("GATEWAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());
        let wrapper_path = std::env::var("AGENT_WRAPPER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("agent-wrapper.sh"));

        Ok(Self {
            secret,
            encryption_key_hex,
            github_client_id: github_client_id.unwrap_or_default(),
            github_client_secret: github_client_secret.unwrap_or_default(),
            allowed_user: allowed_user.unwrap_or_default(),
            public_url: public_url
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            port,
            data_dir,
            wrapper_path,
            sandbox_container: std::env::var("SANDBOX_CONTAINER_NAME").ok(),
            sandbox_image: std::env::var("SANDBOX_IMAGE")
                .unwrap_or_else(|_| DEFAULT_SANDBOX_IMAGE.to_string()),
            ws_path: std::env::var("GATEWAY_WS_PATH")
                .unwrap_or_else(|_| DEFAULT_WS_PATH.to_string()),
        })
    }
}

fn required(name: &str, missing: &mut Vec<String>) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => {
            missing.push(name.to_string());
            None
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("agent-gateway"))
        .unwrap_or_else(|| PathBuf::from(".").join(".agent-gateway"))
}
