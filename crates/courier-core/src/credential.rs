//! Decode-only view of bearer credentials.
//!
//! Nothing in this module verifies a signature. Claims are read only to make
//! local caching decisions; the service remains the authority on whether a
//! credential is valid. Do not use these helpers as an authentication check.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Credential decode error.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed credential: expected 3 segments, got {0}")]
    Segments(usize),
    #[error("Invalid payload encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("Invalid payload claims: {0}")]
    Claims(#[from] serde_json::Error),
}

/// Claims read from a credential payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedCredential {
    /// Device the credential was issued for.
    #[serde(rename = "device_id", alias = "deviceId", alias = "did")]
    pub device_id: String,

    /// Expiry (Unix epoch seconds).
    #[serde(rename = "exp")]
    pub expires_at: i64,
}

impl DecodedCredential {
    /// Seconds until expiry; negative once expired.
    #[must_use]
    pub const fn seconds_remaining(&self, now: i64) -> i64 {
        self.expires_at.saturating_sub(now)
    }

    /// Whether the credential is expired or expires within `window` seconds.
    #[must_use]
    pub const fn is_expiring(&self, now: i64, window: i64) -> bool {
        self.seconds_remaining(now) <= window
    }
}

/// Read the claims of a `header.payload.signature` credential without
/// verifying it.
///
/// # Errors
/// Returns error if the credential is not three segments, the payload is
/// not base64url, or the payload lacks the `exp` or device claims.
pub fn decode_unverified(credential: &str) -> Result<DecodedCredential, DecodeError> {
    let segments: Vec<&str> = credential.split('.').collect();
    let [_, payload, _] = segments.as_slice() else {
        return Err(DecodeError::Segments(segments.len()));
    };

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Generate a fresh device identifier.
///
/// Only used when no identifier can be recovered from a previous credential.
#[must_use]
pub fn generate_device_id() -> String {
    format!("DEV{}", Uuid::new_v4().simple()).to_uppercase()
}
