//! The auth gateway: pairing-token issue/exchange and session validation.

use std::time::Duration;

use tracing::{info, warn};

use crate::{
    AuthError, PairingTokens, SessionRepo,
    token::{generate_pairing_token, generate_session_token, hash_token},
};

pub struct AuthGateway {
    pairing: PairingTokens,
    sessions: SessionRepo,
}

impl AuthGateway {
    pub fn new(sessions: SessionRepo) -> Self {
        Self {
            pairing: PairingTokens::new(),
            sessions,
        }
    }

    /// Custom pairing TTL; tests use short ones.
    pub fn with_pairing_ttl(sessions: SessionRepo, ttl: Duration) -> Self {
        Self {
            pairing: PairingTokens::with_ttl(ttl),
            sessions,
        }
    }

    /// Mint a pairing token. Returns the raw token (display out-of-band,
    /// e.g. as a QR code) and its expiry as epoch milliseconds. Only the
    /// hash is retained.
    pub fn create_pairing_token(&self) -> (String, u64) {
        let token = generate_pairing_token();
        let expires_at = self.pairing.insert(hash_token(&token));
        info!(expires_at_ms = expires_at, "pairing token created");
        (token, expires_at)
    }

    /// Exchange a pairing token for a session token. Single use: the
    /// pairing entry is gone afterwards whether or not the exchange
    /// succeeded. All failures collapse into one generic error.
    pub async fn pair(
        &self,
        pairing_token: &str,
        device_name: Option<&str>,
    ) -> Result<String, AuthError> {
        if !self.pairing.consume(&hash_token(pairing_token)) {
            warn!("pairing attempt with invalid or expired token");
            return Err(AuthError::InvalidOrExpired);
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let session_token = generate_session_token();
        self.sessions
            .create(&session_id, &hash_token(&session_token), device_name)
            .await?;

        info!(session_id = %session_id, device_name, "device paired");
        Ok(session_token)
    }

    /// Validate a session token. Hashed indexed lookup; bumps
    /// `last_seen_at` on success and returns the session id.
    pub async fn validate_session(&self, session_token: &str) -> Result<String, AuthError> {
        let row = self
            .sessions
            .find_by_token_hash(&hash_token(session_token))
            .await?
            .ok_or(AuthError::Unauthenticated)?;

        self.sessions.touch(&row.id).await?;
        Ok(row.id)
    }

    /// Revoke a session by id (unpair a device).
    pub async fn revoke_session(&self, session_id: &str) -> Result<(), AuthError> {
        self.sessions.revoke(session_id).await?;
        info!(session_id, "session revoked");
        Ok(())
    }

    /// Sweep expired pairing tokens. Returns the count removed.
    pub fn purge_expired_pairing_tokens(&self) -> usize {
        let purged = self.pairing.purge_expired();
        if purged > 0 {
            info!(purged, "purged expired pairing tokens");
        }
        purged
    }

    pub fn sessions(&self) -> &SessionRepo {
        &self.sessions
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn gateway() -> AuthGateway {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SessionRepo::init(&pool).await.unwrap();
        AuthGateway::new(SessionRepo::new(pool))
    }

    #[tokio::test]
    async fn pairing_token_exchanges_exactly_once() {
        let auth = gateway().await;
        let (token, _) = auth.create_pairing_token();

        let session_token = auth.pair(&token, Some("phone")).await.unwrap();
        assert!(!session_token.is_empty());

        // Second exchange with the same token fails, even before expiry.
        assert!(matches!(
            auth.pair(&token, None).await,
            Err(AuthError::InvalidOrExpired)
        ));
    }

    #[tokio::test]
    async fn expired_pairing_token_is_rejected_and_purged() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SessionRepo::init(&pool).await.unwrap();
        let auth = AuthGateway::with_pairing_ttl(SessionRepo::new(pool), Duration::ZERO);

        let (token, _) = auth.create_pairing_token();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(auth.pair(&token, None).await.is_err());

        // Sweep finds nothing left: the failed exchange already evicted it.
        assert_eq!(auth.purge_expired_pairing_tokens(), 0);
    }

    #[tokio::test]
    async fn garbage_token_fails_with_generic_error() {
        let auth = gateway().await;
        let err = auth.pair("not-a-token", None).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid or expired token");
    }

    #[tokio::test]
    async fn validate_returns_stable_id_and_bumps_last_seen() {
        let auth = gateway().await;
        let (token, _) = auth.create_pairing_token();
        let session_token = auth.pair(&token, None).await.unwrap();

        let id1 = auth.validate_session(&session_token).await.unwrap();
        let seen1 = auth.sessions().get(&id1).await.unwrap().unwrap().last_seen_at;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let id2 = auth.validate_session(&session_token).await.unwrap();
        let seen2 = auth.sessions().get(&id2).await.unwrap().unwrap().last_seen_at;

        assert_eq!(id1, id2);
        assert!(seen2 >= seen1);
    }

    #[tokio::test]
    async fn revoked_session_no_longer_validates() {
        let auth = gateway().await;
        let (token, _) = auth.create_pairing_token();
        let session_token = auth.pair(&token, None).await.unwrap();
        let id = auth.validate_session(&session_token).await.unwrap();

        auth.revoke_session(&id).await.unwrap();
        assert!(matches!(
            auth.validate_session(&session_token).await,
            Err(AuthError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn raw_tokens_are_never_stored() {
        let auth = gateway().await;
        let (token, _) = auth.create_pairing_token();
        let session_token = auth.pair(&token, None).await.unwrap();
        let rows = auth.sessions().list_active().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_ne!(rows[0].token_hash, session_token);
        assert_eq!(rows[0].token_hash, hash_token(&session_token));
    }
}
