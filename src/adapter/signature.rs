use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-foreman-signature";

#[derive(Debug, Error)]
#[error("Signature verification failed: {0}")]
pub struct SignatureError(String);

/// Sign a worker request body. Produces `sha256=<hex>`.
pub fn sign_payload(secret: &str, payload: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SignatureError(format!("Invalid HMAC key: {e}")))?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Verify the HMAC-SHA256 signature a remote caller attached to a worker request.
pub fn verify_signature(secret: &str, payload: &[u8], signature_header: &str) -> Result<(), SignatureError> {
    let signature_hex = signature_header
        .strip_prefix("sha256=")
        .ok_or_else(|| SignatureError("Missing sha256= prefix".to_string()))?;

    let signature_bytes = hex::decode(signature_hex)
        .map_err(|e| SignatureError(format!("Invalid hex in signature: {e}")))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SignatureError(format!("Invalid HMAC key: {e}")))?;

    mac.update(payload);

    mac.verify_slice(&signature_bytes)
        .map_err(|_| SignatureError("Signature mismatch".to_string()))
}
