use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use uuid::Uuid;

/// Minimum random byte count for an access-URI token.
const ACCESS_URI_BYTES: usize = 66;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("password hash is malformed: {0}")]
    MalformedHash(String),
    #[error("password hashing failed: {0}")]
    HashFailure(String),
}

/// Hash a new password with Argon2id using a freshly generated salt.
pub fn hash_password(password: &str) -> Result<String, CryptoError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| CryptoError::HashFailure(err.to_string()))
}

/// Constant-time compare of a plaintext password against a stored Argon2 hash.
pub fn verify_password(password: &str, stored_hash: &str) -> Result<bool, CryptoError> {
    let parsed =
        PasswordHash::new(stored_hash).map_err(|err| CryptoError::MalformedHash(err.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Mint an opaque access-URI token: `ACCESS_URI_BYTES` random bytes,
/// URL-safe base64 with no padding, sized up to the byte-count floor this
/// system's access links require.
pub fn generate_access_uri_token() -> String {
    let mut bytes = [0u8; ACCESS_URI_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Allocate a new 128-bit opaque identifier for a content-like entity
/// (Document, Field, File, ...). Rendered externally as 32 lowercase hex
/// characters via [`Uuid::simple`].
pub fn generate_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trip() {
        let hash = hash_password("correct horse battery staple").expect("hash");
        assert!(verify_password("correct horse battery staple", &hash).expect("verify"));
        assert!(!verify_password("wrong", &hash).expect("verify"));
    }

    #[test]
    fn access_uri_tokens_are_unique_and_long_enough() {
        let a = generate_access_uri_token();
        let b = generate_access_uri_token();
        assert_ne!(a, b);
        // base64 (no padding) of 66 bytes is ceil(66*4/3) = 88 chars
        assert!(a.len() >= 88);
    }

    #[test]
    fn malformed_hash_is_rejected() {
        let err = verify_password("whatever", "not-a-hash").unwrap_err();
        matches!(err, CryptoError::MalformedHash(_));
    }
}
