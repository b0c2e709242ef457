//! Ollama provider for local models.
//!
//! Chat goes through Ollama's OpenAI-compatible `/v1/chat/completions`
//! endpoint; model listing uses the native `/api/tags` API, which carries
//! parameter-size metadata the compatible surface lacks.

use std::pin::Pin;

use {async_trait::async_trait, tokio_stream::Stream};

use tracing::{debug, warn};

use crate::{
    Capability, ChatMessage, ChatResponse, LlmProvider, ModelInfo, StreamEvent,
    openai::{chat_completions, stream_completions, to_openai_messages},
};

pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

pub struct OllamaProvider {
    base_url: String,
    client: reqwest::Client,
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new(DEFAULT_OLLAMA_URL.into())
    }
}

impl OllamaProvider {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: crate::shared_http_client().clone(),
        }
    }

    fn chat_request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(body)
    }

    fn capabilities_for(model_name: &str) -> Vec<Capability> {
        let lower = model_name.to_ascii_lowercase();
        let mut caps = vec![Capability::Language];
        if lower.contains("llava") || lower.contains("vision") || lower.contains("vl") {
            caps.push(Capability::Vision);
        }
        if lower.contains("deepseek-r1") || lower.contains("qwq") {
            caps.push(Capability::Reasoning);
        }
        caps
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    /// Probes the daemon root. Ollama answers any GET on `/` when up.
    async fn is_available(&self) -> bool {
        self.client
            .get(&self.base_url)
            .timeout(std::time::Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;

        let models = resp["models"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| {
                        let name = m["name"].as_str()?;
                        Some(ModelInfo {
                            id: name.to_string(),
                            name: name.to_string(),
                            provider: self.name().into(),
                            capabilities: Self::capabilities_for(name),
                            size: m["details"]["parameter_size"]
                                .as_str()
                                .map(str::to_string),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(models)
    }

    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> anyhow::Result<ChatResponse> {
        let body = serde_json::json!({
            "model": model,
            "messages": to_openai_messages(messages),
        });
        debug!(model, "ollama chat request");
        chat_completions(self.chat_request(&body), model)
            .await
            .inspect_err(|e| warn!(model, error = %e, "ollama chat failed"))
    }

    fn chat_stream(
        &self,
        model: String,
        messages: Vec<ChatMessage>,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
        let body = serde_json::json!({
            "model": model,
            "messages": to_openai_messages(&messages),
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        debug!(model = %model, "ollama stream request");
        stream_completions(self.chat_request(&body), model)
    }
}
