use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use std::path::Path;

use crate::error::{AppError, Result};

#[derive(Debug, Serialize)]
struct JwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// Sign a short-lived GitHub App JWT, used only to mint installation tokens.
pub fn generate_app_jwt(app_id: u64, private_key_path: &Path) -> Result<String> {
    let key_pem = std::fs::read(private_key_path).map_err(|e| {
        AppError::Config(format!(
            "Failed to read private key at {}: {e}",
            private_key_path.display()
        ))
    })?;
    app_jwt_from_pem(app_id, &key_pem, chrono::Utc::now().timestamp())
}

fn app_jwt_from_pem(app_id: u64, key_pem: &[u8], now: i64) -> Result<String> {
    let encoding_key = EncodingKey::from_rsa_pem(key_pem)
        .map_err(|e| AppError::Config(format!("Invalid RSA private key: {e}")))?;

    // Backdated for clock drift; GitHub caps the lifetime at 10 minutes.
    let claims = JwtClaims {
        iat: now - 60,
        exp: now + 10 * 60,
        iss: app_id.to_string(),
    };

    encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
        .map_err(|e| AppError::Config(format!("Failed to generate JWT: {e}")))
}
