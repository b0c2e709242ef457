//! SQLite-backed session repository.
//!
//! One row per paired device. Sessions are logically deleted via the
//! `revoked` flag; rows are never physically removed while referenced.

use sqlx::SqlitePool;

/// A persisted device session.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub token_hash: String,
    pub device_name: Option<String>,
    pub created_at: i64,
    pub last_seen_at: i64,
    pub revoked: bool,
}

pub struct SessionRepo {
    pool: SqlitePool,
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl SessionRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the sessions table schema. The unique index on
    /// `token_hash` keeps validation an O(1) indexed lookup.
    pub async fn init(pool: &SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id           TEXT    PRIMARY KEY,
                token_hash   TEXT    NOT NULL UNIQUE,
                device_name  TEXT,
                created_at   INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                revoked      INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn create(
        &self,
        id: &str,
        token_hash: &str,
        device_name: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let now = now_ms();
        sqlx::query(
            "INSERT INTO sessions (id, token_hash, device_name, created_at, last_seen_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(token_hash)
        .bind(device_name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Find a non-revoked session by token hash.
    pub async fn find_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<SessionRow>, sqlx::Error> {
        sqlx::query_as::<_, SessionRow>(
            "SELECT id, token_hash, device_name, created_at, last_seen_at, revoked
             FROM sessions WHERE token_hash = ? AND revoked = 0",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
    }

    /// Bump `last_seen_at` to now.
    pub async fn touch(&self, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE sessions SET last_seen_at = ? WHERE id = ?")
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Logical delete. The row stays for audit; validation stops matching.
    pub async fn revoke(&self, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE sessions SET revoked = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_active(&self) -> Result<Vec<SessionRow>, sqlx::Error> {
        sqlx::query_as::<_, SessionRow>(
            "SELECT id, token_hash, device_name, created_at, last_seen_at, revoked
             FROM sessions WHERE revoked = 0 ORDER BY last_seen_at DESC",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<SessionRow>, sqlx::Error> {
        sqlx::query_as::<_, SessionRow>(
            "SELECT id, token_hash, device_name, created_at, last_seen_at, revoked
             FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }
}
