use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use time::{Duration, OffsetDateTime};

use super::{SignerError, MIN_SECRET_LEN};

type HmacSha256 = Hmac<Sha256>;

pub const TICKET_TTL: Duration = Duration::seconds(30);
const NONCE_LEN: usize = 16;

/// Stateless short-lived tickets for WebSocket upgrades in environments that
/// do not send cookies on the upgrade request.
///
/// Format: `<ts_base36>.<nonce_b64url>.<base64url(hmac_sha256(secret,
/// "<ts_base36>.<nonce_b64url>"))>`.
#[derive(Clone)]
pub struct TicketIssuer {
    secret: Vec<u8>,
}

impl TicketIssuer {
    pub fn new(secret: &str) -> Result<Self, SignerError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(SignerError::SecretTooShort);
        }
        Ok(Self {
            secret: secret.as_bytes().to_vec(),
        })
    }

    pub fn issue(&self, now: OffsetDateTime) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let payload = format!(
            "{}.{}",
            to_base36(now.unix_timestamp().max(0) as u64),
            URL_SAFE_NO_PAD.encode(nonce)
        );
        format!("{payload}.{}", self.mac_of(&payload))
    }

    pub fn validate(&self, ticket: &str, now: OffsetDateTime) -> bool {
        let mut parts = ticket.split('.');
        let (ts, nonce, mac_b64) = match (parts.next(), parts.next(), parts.next()) {
            (Some(ts), Some(nonce), Some(mac)) if parts.next().is_none() => (ts, nonce, mac),
            _ => return false,
        };
        if ts.is_empty() || nonce.is_empty() {
            return false;
        }
        let Some(issued_at) = from_base36(ts) else {
            return false;
        };
        let age = now.unix_timestamp() - issued_at as i64;
        if age < 0 || age >= TICKET_TTL.whole_seconds() {
            return false;
        }

        let Ok(mac_bytes) = URL_SAFE_NO_PAD.decode(mac_b64) else {
            return false;
        };
        let payload = format!("{ts}.{nonce}");
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(payload.as_bytes());
        mac.verify_slice(&mac_bytes).is_ok()
    }

    fn mac_of(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

fn from_base36(input: &str) -> Option<u64> {
    let mut value: u64 = 0;
    for c in input.chars() {
        let digit = c.to_digit(36)?;
        value = value.checked_mul(36)?.checked_add(digit as u64)?;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn issuer() -> TicketIssuer {
        TicketIssuer::new(SECRET).unwrap()
    }

    #[test]
    fn fresh_ticket_validates() {
        let now = OffsetDateTime::now_utc();
        let ticket = issuer().issue(now);
        assert!(issuer().validate(&ticket, now));
    }

    #[test]
    fn ticket_expires_after_window() {
        let now = OffsetDateTime::now_utc();
        let ticket = issuer().issue(now);
        assert!(issuer().validate(&ticket, now + Duration::seconds(29)));
        assert!(!issuer().validate(&ticket, now + Duration::seconds(30)));
        assert!(!issuer().validate(&ticket, now + Duration::seconds(120)));
    }

    #[test]
    fn future_ticket_rejected() {
        let now = OffsetDateTime::now_utc();
        let ticket = issuer().issue(now + Duration::seconds(60));
        assert!(!issuer().validate(&ticket, now));
    }

    #[test]
    fn tampered_mac_rejected() {
        let now = OffsetDateTime::now_utc();
        let mut ticket = issuer().issue(now);
        let last = ticket.pop().unwrap();
        ticket.push(if last == 'A' { 'B' } else { 'A' });
        assert!(!issuer().validate(&ticket, now));
    }

    #[test]
    fn wrong_length_mac_rejected() {
        let now = OffsetDateTime::now_utc();
        let ticket = issuer().issue(now);
        let truncated: String = ticket[..ticket.len() - 4].to_string();
        assert!(!issuer().validate(&truncated, now));
    }

    #[test]
    fn structural_garbage_rejected() {
        let now = OffsetDateTime::now_utc();
        assert!(!issuer().validate("", now));
        assert!(!issuer().validate("a.b", now));
        assert!(!issuer().validate(".nonce.mac", now));
        assert!(!issuer().validate("ts..mac", now));
        assert!(!issuer().validate("a.b.c.d", now));
    }

    #[test]
    fn base36_round_trips() {
        for value in [0u64, 1, 35, 36, 1_722_000_000] {
            assert_eq!(from_base36(&to_base36(value)), Some(value));
        }
        assert_eq!(from_base36("not base36 !"), None);
    }
}
