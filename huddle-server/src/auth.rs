//! Credential verification for incoming connections.
//!
//! Credentials are compact signed tokens of the form
//! `v1.<claims-b64>.<signature-b64>` where both segments are URL-safe
//! base64 without padding and the signature is HMAC-SHA256 over the
//! encoded claims. The server only trusts the user id carried in a
//! token whose signature and expiry check out.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use huddle_proto::ids::UserId;

/// Version prefix every acceptable token starts with.
pub const TOKEN_VERSION: &str = "v1";

/// Claims carried inside a credential token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id the token was minted for.
    pub sub: i64,
    /// Expiry as seconds since the UNIX epoch.
    pub exp: u64,
}

/// Why a connection failed to authenticate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No credential was presented on any accepted channel.
    #[error("no credential presented")]
    MissingCredential,
    /// The credential is malformed or its signature does not verify.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    /// The credential's expiry has passed.
    #[error("credential expired")]
    ExpiredCredential,
    /// The credential names a user the directory does not recognize as
    /// active.
    #[error("unknown or inactive user")]
    UnknownOrInactiveUser,
    /// Verification could not complete for an internal reason.
    #[error("credential check failed: {0}")]
    Internal(String),
}

/// Verifies and mints credential tokens with a shared secret.
#[derive(Clone)]
pub struct Authenticator {
    secret: String,
}

impl Authenticator {
    /// Creates an authenticator around the shared signing secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Verifies a token's format, signature and expiry.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredential`] for format or signature
    /// problems and [`AuthError::ExpiredCredential`] once `exp` has
    /// passed.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 || parts[0] != TOKEN_VERSION {
            return Err(AuthError::InvalidCredential("bad token format".into()));
        }

        let payload_b64 = parts[1];
        let sig_b64 = parts[2];

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| AuthError::InvalidCredential(format!("payload encoding: {e}")))?;
        let provided_sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|e| AuthError::InvalidCredential(format!("signature encoding: {e}")))?;
        let expected_sig = hmac_sign(payload_b64.as_bytes(), self.secret.as_bytes())?;

        if !constant_time_eq(&expected_sig, &provided_sig) {
            return Err(AuthError::InvalidCredential("signature mismatch".into()));
        }

        let claims: Claims = serde_json::from_slice(&payload)
            .map_err(|e| AuthError::InvalidCredential(format!("claims encoding: {e}")))?;
        if claims.exp <= now_secs() {
            return Err(AuthError::ExpiredCredential);
        }

        Ok(claims)
    }

    /// Mints a token for `user_id` that expires after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Internal`] if the claims cannot be encoded.
    pub fn sign(&self, user_id: UserId, ttl: Duration) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user_id.as_i64(),
            exp: now_secs().saturating_add(ttl.as_secs()),
        };
        let payload = serde_json::to_vec(&claims)
            .map_err(|e| AuthError::Internal(format!("claims encoding: {e}")))?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
        let sig = hmac_sign(payload_b64.as_bytes(), self.secret.as_bytes())?;
        let sig_b64 = URL_SAFE_NO_PAD.encode(sig);
        Ok(format!("{TOKEN_VERSION}.{payload_b64}.{sig_b64}"))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn hmac_sign(payload_b64: &[u8], secret: &[u8]) -> Result<Vec<u8>, AuthError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|e| AuthError::Internal(format!("hmac key: {e}")))?;
    mac.update(payload_b64);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }

    diff == 0
}
