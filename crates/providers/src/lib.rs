//! LLM provider implementations and the capability registry.

pub mod anthropic;
pub mod ollama;
pub mod openai;
mod registry;

use std::pin::Pin;

use {async_trait::async_trait, tokio_stream::Stream};

pub use {
    hearth_protocol::{Capability, ChatMessage, Role},
    registry::{CapabilitySlot, ProviderRegistry, RegistryError},
};

/// Shared HTTP client for providers.
///
/// Providers without custom redirect/proxy needs reuse this client to
/// share connection pools, DNS cache, and TLS sessions.
pub fn shared_http_client() -> &'static reqwest::Client {
    static CLIENT: std::sync::LazyLock<reqwest::Client> =
        std::sync::LazyLock::new(reqwest::Client::new);
    &CLIENT
}

/// Info about a model a provider offers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<Capability>,
    /// Parameter-count hint for local models, e.g. "7B".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

/// Final response of a completed chat call or stream.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_used: Option<u32>,
}

/// Events emitted during a streaming chat completion.
///
/// A well-formed stream is zero-or-more `Delta`s followed by exactly one
/// terminal `Done` or `Error`, after which the stream ends.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Text content fragment.
    Delta(String),
    /// Stream completed; carries the accumulated response and usage.
    Done(ChatResponse),
    /// Upstream failure; no further events follow.
    Error(String),
}

/// A chat-capable model backend, local or remote.
///
/// Providers are registered once at startup and are immutable thereafter;
/// the registry shares them behind `Arc<dyn LlmProvider>`.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this provider is currently reachable/configured.
    async fn is_available(&self) -> bool;

    /// Models this provider offers.
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>>;

    /// Single-shot chat: waits for the full response.
    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> anyhow::Result<ChatResponse>;

    /// Streaming chat. Dropping the returned stream aborts the underlying
    /// request.
    fn chat_stream(
        &self,
        model: String,
        messages: Vec<ChatMessage>,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>>;
}
