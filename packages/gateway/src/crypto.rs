use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption key must be 64 hex characters")]
    InvalidKey,
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("ciphertext authentication failed")]
    AuthenticationFailed,
}

/// AES-256-GCM cipher for token blobs stored in the config table.
///
/// Encoded form is `<iv_hex>:<tag_hex>:<ciphertext_hex>`; the ciphertext
/// segment is empty for empty plaintext.
#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; 32],
}

impl TokenCipher {
    pub fn from_hex(key_hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(key_hex).map_err(|_| CryptoError::InvalidKey)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { key })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::InvalidKey)?;
        let mut iv = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);
        let mut sealed = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        // aes-gcm appends the tag to the ciphertext; split it back out.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(sealed)
        ))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        let mut parts = encoded.split(':');
        let (iv_hex, tag_hex, ct_hex) = match (parts.next(), parts.next(), parts.next()) {
            (Some(iv), Some(tag), Some(ct)) if parts.next().is_none() => (iv, tag, ct),
            _ => return Err(CryptoError::InvalidFormat),
        };
        let iv = hex::decode(iv_hex).map_err(|_| CryptoError::InvalidFormat)?;
        let tag = hex::decode(tag_hex).map_err(|_| CryptoError::InvalidFormat)?;
        let ciphertext = hex::decode(ct_hex).map_err(|_| CryptoError::InvalidFormat)?;
        if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(CryptoError::InvalidFormat);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::InvalidKey)?;
        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);
        let plain = cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_ref())
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        String::from_utf8(plain).map_err(|_| CryptoError::AuthenticationFailed)
    }
}
