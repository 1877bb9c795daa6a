//! Browser-facing authentication: signed session cookies, short-lived
//! WebSocket tickets, and the identity-provider sign-in flow.

pub mod cookie;
pub mod github;
pub mod ticket;

use thiserror::Error;

pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("signing secret must be at least {MIN_SECRET_LEN} characters")]
    SecretTooShort,
}
