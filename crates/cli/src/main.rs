//! The `hearth` gateway binary. Wires config, storage, providers, and
//! the HTTP/WebSocket server together.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use {
    anyhow::Context,
    clap::Parser,
    secrecy::Secret,
    tracing::{info, warn},
    tracing_subscriber::EnvFilter,
};

use {
    hearth_auth::{AuthGateway, SessionRepo},
    hearth_gateway::{GatewayState, build_router},
    hearth_protocol::Capability,
    hearth_providers::{
        LlmProvider, ProviderRegistry, anthropic::AnthropicProvider, ollama::OllamaProvider,
        openai::OpenAiProvider,
    },
};

const PAIRING_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "hearth", version, about = "Personal home-server AI gateway")]
struct Cli {
    /// Address to bind.
    #[arg(long, env = "HEARTH_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on.
    #[arg(long, env = "HEARTH_PORT", default_value_t = 8787)]
    port: u16,

    /// Data directory (sqlite database lives here).
    #[arg(long, env = "HEARTH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, env = "HEARTH_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn default_data_dir() -> anyhow::Result<PathBuf> {
    let dirs = directories::UserDirs::new().context("cannot determine home directory")?;
    Ok(dirs.home_dir().join(".hearth"))
}

/// Register configured providers and assign the default capability
/// chains. Earlier assignments win; local models are the fallback.
async fn build_registry() -> anyhow::Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    let anthropic_key = std::env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.is_empty());
    let openai_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
    let ollama_url = std::env::var("OLLAMA_BASE_URL")
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| hearth_providers::ollama::DEFAULT_OLLAMA_URL.to_string());

    if let Some(key) = anthropic_key {
        registry.register_provider(Arc::new(AnthropicProvider::new(Secret::new(key))));
        registry.assign(Capability::Language, "claude", "claude-sonnet-4-5-20250929")?;
        registry.assign(Capability::Reasoning, "claude", "claude-opus-4-1-20250805")?;
        registry.assign(Capability::Vision, "claude", "claude-sonnet-4-5-20250929")?;
        info!("anthropic provider configured");
    }

    if let Some(key) = openai_key {
        registry.register_provider(Arc::new(OpenAiProvider::new(Secret::new(key))));
        registry.assign(Capability::Language, "openai", "gpt-4o")?;
        registry.assign(Capability::Reasoning, "openai", "o3-mini")?;
        registry.assign(Capability::Vision, "openai", "gpt-4o")?;
        registry.assign(Capability::Stt, "openai", "whisper-1")?;
        registry.assign(Capability::Tts, "openai", "tts-1")?;
        info!("openai provider configured");
    }

    let ollama = OllamaProvider::new(ollama_url.clone());
    if ollama.is_available().await {
        let model = ollama
            .list_models()
            .await
            .ok()
            .and_then(|models| models.first().map(|m| m.id.clone()));
        registry.register_provider(Arc::new(ollama));
        if let Some(model) = model {
            registry.assign(Capability::Language, "ollama", model)?;
        }
        info!(url = %ollama_url, "ollama provider configured");
    } else {
        info!(url = %ollama_url, "ollama not reachable, skipping");
    }

    Ok(registry)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            },
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let db_path = data_dir.join("hearth.db");
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect_with(
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(&db_path)
                .create_if_missing(true),
        )
        .await
        .with_context(|| format!("opening database {}", db_path.display()))?;
    SessionRepo::init(&pool).await?;

    let registry = build_registry().await?;
    let auth = AuthGateway::new(SessionRepo::new(pool));
    let state = Arc::new(GatewayState::new(auth, registry));

    // Expired pairing tokens are swept in the background so an abandoned
    // pairing attempt doesn't linger until the next exchange.
    let purge_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PAIRING_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            purge_state.auth.purge_expired_pairing_tokens();
        }
    });

    let app = build_router(Arc::clone(&state));
    let bind_addr = format!("{}:{}", cli.bind, cli.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, db = %db_path.display(), "hearth gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Kill whatever shells are still running before exiting.
    state.shells.shutdown();
    info!("shutdown complete");
    Ok(())
}
