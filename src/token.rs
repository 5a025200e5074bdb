//! Correlation token signing.
//!
//! Tokens are HMAC-SHA256 signed: `{timestamp}.{nonce}.{hmac}`. The
//! timestamp is Unix seconds and the nonce a random UUID.

use crate::error::{ConfigError, TamperingError};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Issues and verifies correlation tokens.
#[derive(Clone)]
pub struct TokenSigner {
    mac: HmacSha256,
    validity_seconds: u64,
}

impl TokenSigner {
    pub fn new(secret: &str, validity_seconds: u64) -> Result<Self, ConfigError> {
        if secret.is_empty() {
            return Err(ConfigError::Missing("correlation.token_secret"));
        }
        let mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| {
            ConfigError::InvalidValue {
                field: "correlation.token_secret",
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            mac,
            validity_seconds,
        })
    }

    pub fn validity_seconds(&self) -> u64 {
        self.validity_seconds
    }

    /// Issue a token stamped with the current time.
    pub fn issue(&self) -> String {
        self.issue_at(Utc::now().timestamp())
    }

    pub fn issue_at(&self, timestamp: i64) -> String {
        let data = format!("{}.{}", timestamp, Uuid::new_v4().simple());
        let signature = hex::encode(self.sign(&data).finalize().into_bytes());
        format!("{}.{}", data, signature)
    }

    /// Verify signature and validity window against the current time.
    pub fn verify(&self, token: &str) -> Result<(), TamperingError> {
        self.verify_at(token, Utc::now().timestamp())
    }

    pub fn verify_at(&self, token: &str, now: i64) -> Result<(), TamperingError> {
        let mut parts = token.splitn(3, '.');
        let (Some(timestamp), Some(nonce), Some(signature)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(TamperingError::InvalidToken);
        };

        let issued: i64 = timestamp.parse().map_err(|_| TamperingError::InvalidToken)?;
        let age = now - issued;
        if age < 0 || age as u64 > self.validity_seconds {
            return Err(TamperingError::InvalidToken);
        }

        let provided = hex::decode(signature).map_err(|_| TamperingError::InvalidToken)?;
        // verify_slice compares in constant time
        self.sign(&format!("{}.{}", timestamp, nonce))
            .verify_slice(&provided)
            .map_err(|_| TamperingError::InvalidToken)
    }

    fn sign(&self, data: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(data.as_bytes());
        mac
    }
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("validity_seconds", &self.validity_seconds)
            .finish_non_exhaustive()
    }
}
