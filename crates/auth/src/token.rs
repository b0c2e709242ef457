//! Token generation and hashing. No plaintext secret ever leaves this
//! module in a storable form: persist only [`hash_token`] output.

use {
    base64::Engine,
    rand::RngCore,
    sha2::{Digest, Sha256},
};

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// 32 random bytes, URL-safe base64. Shown once to the operator.
pub fn generate_pairing_token() -> String {
    random_token(32)
}

/// 48 random bytes, URL-safe base64. Returned once on successful pairing.
pub fn generate_session_token() -> String {
    random_token(48)
}

/// SHA-256 hex digest of a raw token. The only comparable representation.
pub fn hash_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}
