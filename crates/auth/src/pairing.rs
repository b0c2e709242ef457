//! In-memory pairing-token set.
//!
//! Pairing tokens are ephemeral: held only in process memory, consumed on
//! first successful exchange, swept on expiry. Nothing here touches disk.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

const PAIRING_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
struct PairingEntry {
    expires_at_ms: u64,
}

/// Set of outstanding pairing-token hashes, keyed by token hash.
pub struct PairingTokens {
    entries: Mutex<HashMap<String, PairingEntry>>,
    ttl: Duration,
}

impl Default for PairingTokens {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl PairingTokens {
    pub fn new() -> Self {
        Self::with_ttl(PAIRING_TTL)
    }

    /// Custom TTL; tests use short ones.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record a freshly generated token hash. Returns its expiry as epoch
    /// milliseconds, for display alongside the raw token.
    pub fn insert(&self, token_hash: String) -> u64 {
        let expires_at_ms = now_ms() + self.ttl.as_millis() as u64;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(token_hash, PairingEntry { expires_at_ms });
        expires_at_ms
    }

    /// Consume an entry by hash. One-time use: the entry is removed whether
    /// it was valid or merely found expired. Returns true only for a live
    /// entry.
    pub fn consume(&self, token_hash: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.remove(token_hash) {
            Some(entry) => now_ms() <= entry.expires_at_ms,
            None => false,
        }
    }

    /// Sweep expired entries. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = now_ms();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| now <= entry.expires_at_ms);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
