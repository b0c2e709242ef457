//! Pairing and session-token authentication.
//!
//! A device pairs once: the operator creates a short-lived pairing token
//! (shown out-of-band, e.g. as a QR code), the device exchanges it exactly
//! once for a long-lived session token, and every later request or
//! connection presents that session token. Raw tokens are never stored;
//! only SHA-256 hashes are persisted or compared.

mod gateway;
mod pairing;
mod sessions;
mod token;

pub use {
    gateway::AuthGateway,
    pairing::PairingTokens,
    sessions::{SessionRepo, SessionRow},
    token::{generate_pairing_token, generate_session_token, hash_token},
};

/// Authentication failure.
///
/// Deliberately coarse: callers must not be able to distinguish a token
/// that never existed from one that expired or was revoked.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidOrExpired,

    #[error("unauthenticated")]
    Unauthenticated,

    #[error(transparent)]
    Store(#[from] sqlx::Error),
}
