//! Webhook signature verification.
//!
//! ```text
//!   Processor-Signature: t=1700000000,v1=5257a869e7…[,v1=…]
//!
//!   v1 = hex(HMAC-SHA256(secret, "{t}.{raw body}"))
//! ```
//!
//! Several `v1` entries may appear while the secret is being rotated; one
//! match is enough. The timestamp must lie within the tolerance window in
//! either direction.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "Processor-Signature";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("Malformed signature header: {0}")]
    Malformed(&'static str),

    #[error("Signature timestamp outside tolerance ({age_secs}s)")]
    OutsideTolerance { age_secs: i64 },

    #[error("No signature matches the payload")]
    Mismatch,
}

fn mac(secret: &str, timestamp: i64, body: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::Malformed("unusable signing secret"))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}

/// Builds a header value for `body` signed at `timestamp`.
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, SignatureError> {
    let digest = mac(secret, timestamp, body)?.finalize().into_bytes();
    Ok(format!("t={},v1={}", timestamp, hex::encode(digest)))
}

/// Verifies `header` against the raw request body.
///
/// `now` is unix seconds.
pub fn verify(
    secret: &str,
    header: &str,
    body: &[u8],
    tolerance: Duration,
    now: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            return Err(SignatureError::Malformed("expected key=value pairs"));
        };
        match key {
            "t" => {
                timestamp = Some(
                    value
                        .parse()
                        .map_err(|_| SignatureError::Malformed("timestamp is not an integer"))?,
                )
            }
            "v1" => {
                // Undecodable entries cannot match; skip them.
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed("missing timestamp"))?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed("missing v1 signature"));
    }

    let age_secs = now - timestamp;
    if age_secs.unsigned_abs() > tolerance.as_secs() {
        return Err(SignatureError::OutsideTolerance { age_secs });
    }

    let expected = mac(secret, timestamp, body)?;
    if signatures
        .iter()
        .any(|candidate| expected.clone().verify_slice(candidate).is_ok())
    {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}
