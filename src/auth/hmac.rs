//! HMAC-SHA256 request signing.
//!
//! Canonical string: `ts + "\n" + METHOD + "\n" + path + "\n" + body`, signed
//! with the agent secret and hex-encoded. Verification is constant-time via
//! the mac itself; the timestamp must sit inside the configured skew window.

use super::AuthError;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub fn canonical_string(ts_ms: i64, method: &str, path: &str, body: &str) -> String {
    format!("{}\n{}\n{}\n{}", ts_ms, method.to_ascii_uppercase(), path, body)
}

/// Hex HMAC-SHA256 of `message` under `secret`.
pub fn sign(secret: &str, message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a signed request against the skew window and the signature.
#[allow(clippy::too_many_arguments)]
pub fn verify_signed_request(
    secret: &str,
    ts_ms: i64,
    method: &str,
    path: &str,
    body: &str,
    signature_hex: &str,
    now_ms: i64,
    window_ms: i64,
) -> Result<(), AuthError> {
    if (now_ms - ts_ms).abs() > window_ms {
        return Err(AuthError::StaleSignature);
    }

    let expected = hex::decode(signature_hex).map_err(|_| AuthError::InvalidSignature)?;
    let message = canonical_string(ts_ms, method, path, body);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AuthError::InvalidSignature)?;
    mac.update(message.as_bytes());
    // Mac::verify_slice is a constant-time comparison.
    mac.verify_slice(&expected)
        .map_err(|_| AuthError::InvalidSignature)
}
