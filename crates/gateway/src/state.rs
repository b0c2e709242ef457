use std::{sync::Arc, time::Instant};

use {hearth_auth::AuthGateway, hearth_providers::ProviderRegistry, hearth_shell::ShellManager};

/// Everything the gateway shares across connections. Built once by the
/// composition root, immutable afterwards.
pub struct GatewayState {
    pub auth: AuthGateway,
    pub registry: ProviderRegistry,
    pub shells: Arc<ShellManager>,
    pub version: String,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(auth: AuthGateway, registry: ProviderRegistry) -> Self {
        Self {
            auth,
            registry,
            shells: Arc::new(ShellManager::new()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
        }
    }
}
