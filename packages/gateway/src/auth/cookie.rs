use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use super::{SignerError, MIN_SECRET_LEN};

type HmacSha256 = Hmac<Sha256>;

pub const COOKIE_NAME: &str = "gateway_session";

/// Signs opaque session tokens carried in the browser cookie.
///
/// Cookie value format: `<token>.<base64url(hmac_sha256(secret, token))>`.
#[derive(Clone, Debug)]
pub struct CookieSigner {
    secret: Vec<u8>,
}

impl CookieSigner {
    pub fn new(secret: &str) -> Result<Self, SignerError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(SignerError::SecretTooShort);
        }
        Ok(Self {
            secret: secret.as_bytes().to_vec(),
        })
    }

    /// Signs a fresh random token and returns the full cookie value.
    pub fn issue(&self) -> String {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        self.sign(&URL_SAFE_NO_PAD.encode(raw))
    }

    pub fn sign(&self, token: &str) -> String {
        format!("{token}.{}", self.mac_of(token))
    }

    /// Returns the underlying token for a valid cookie value, `None` otherwise.
    /// MAC comparison is constant-time.
    pub fn verify(&self, cookie_value: &str) -> Option<String> {
        let (token, mac_b64) = cookie_value.rsplit_once('.')?;
        if token.is_empty() {
            return None;
        }
        let mac_bytes = URL_SAFE_NO_PAD.decode(mac_b64).ok()?;
        let mut mac = HmacSha256::new_from_slice(&self.secret).ok()?;
        mac.update(token.as_bytes());
        mac.verify_slice(&mac_bytes).ok()?;
        Some(token.to_string())
    }

    fn mac_of(&self, token: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(token.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

/// Builds the Set-Cookie header value for a signed session cookie.
pub fn set_cookie_header(cookie_value: &str) -> String {
    format!("{COOKIE_NAME}={cookie_value}; Path=/; HttpOnly; Secure; SameSite=Lax")
}

/// Extracts a named cookie from a Cookie header value.
pub fn cookie_from_header(header: &str, name: &str) -> Option<String> {
    for chunk in header.split(';') {
        let mut parts = chunk.trim().splitn(2, '=');
        let key = parts.next()?.trim();
        let value = parts.next().unwrap_or("").trim();
        if key == name {
            return Some(value.to_string());
        }
    }
    None
}
