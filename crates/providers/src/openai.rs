//! OpenAI Chat Completions provider.

use std::pin::Pin;

use {
    async_trait::async_trait, futures::StreamExt, secrecy::ExposeSecret, tokio_stream::Stream,
};

use tracing::{debug, warn};

use crate::{Capability, ChatMessage, ChatResponse, LlmProvider, ModelInfo, Role, StreamEvent};

const OPENAI_MODELS: &[(&str, &str, &[Capability])] = &[
    (
        "gpt-4o",
        "GPT-4o",
        &[Capability::Language, Capability::Vision],
    ),
    (
        "gpt-4o-mini",
        "GPT-4o mini",
        &[Capability::Language, Capability::Vision],
    ),
    ("o3-mini", "o3-mini", &[Capability::Reasoning]),
    ("whisper-1", "Whisper", &[Capability::Stt]),
    ("tts-1", "TTS-1", &[Capability::Tts]),
];

pub struct OpenAiProvider {
    api_key: secrecy::Secret<String>,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(api_key: secrecy::Secret<String>) -> Self {
        Self::with_base_url(api_key, "https://api.openai.com/v1".into())
    }

    pub fn with_base_url(api_key: secrecy::Secret<String>, base_url: String) -> Self {
        Self {
            api_key,
            base_url,
            client: crate::shared_http_client().clone(),
        }
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(body)
    }
}

/// Convert messages to OpenAI format. Images become `image_url` content
/// parts with data URLs.
pub(crate) fn to_openai_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| {
            let role = match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            match msg.images.as_deref() {
                Some(images) if !images.is_empty() => {
                    let mut parts =
                        vec![serde_json::json!({"type": "text", "text": msg.content})];
                    for data in images {
                        parts.push(serde_json::json!({
                            "type": "image_url",
                            "image_url": {"url": format!("data:image/jpeg;base64,{data}")}
                        }));
                    }
                    serde_json::json!({"role": role, "content": parts})
                },
                _ => serde_json::json!({"role": role, "content": msg.content}),
            }
        })
        .collect()
}

pub(crate) async fn chat_completions(
    request: reqwest::RequestBuilder,
    model: &str,
) -> anyhow::Result<ChatResponse> {
    let http_resp = request.send().await?;
    let status = http_resp.status();
    if !status.is_success() {
        let body_text = http_resp.text().await.unwrap_or_default();
        warn!(status = %status, body = %body_text, "chat completions error");
        anyhow::bail!("chat completions HTTP {status}: {body_text}");
    }

    let resp = http_resp.json::<serde_json::Value>().await?;
    Ok(ChatResponse {
        content: resp["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string(),
        model: model.to_string(),
        tokens_used: resp["usage"]["total_tokens"].as_u64().map(|v| v as u32),
    })
}

/// Stream a Chat Completions response: SSE `data:` lines carrying delta
/// chunks, terminated by `data: [DONE]`.
pub(crate) fn stream_completions(
    request: reqwest::RequestBuilder,
    model: String,
) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send>> {
    Box::pin(async_stream::stream! {
        let resp = match request.send().await {
            Ok(r) => {
                if let Err(e) = r.error_for_status_ref() {
                    let status = e.status().map(|s| s.as_u16()).unwrap_or(0);
                    let body_text = r.text().await.unwrap_or_default();
                    yield StreamEvent::Error(format!("HTTP {status}: {body_text}"));
                    return;
                }
                r
            },
            Err(e) => {
                yield StreamEvent::Error(e.to_string());
                return;
            },
        };

        let mut byte_stream = resp.bytes_stream();
        let mut buf = String::new();
        let mut content = String::new();
        let mut tokens_used: Option<u32> = None;

        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield StreamEvent::Error(e.to_string());
                    return;
                },
            };
            buf.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim().to_string();
                buf = buf[pos + 1..].to_string();

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    yield StreamEvent::Done(ChatResponse {
                        content: std::mem::take(&mut content),
                        model: model.clone(),
                        tokens_used,
                    });
                    return;
                }
                let Ok(evt) = serde_json::from_str::<serde_json::Value>(data) else {
                    continue;
                };
                if let Some(text) = evt["choices"][0]["delta"]["content"].as_str()
                    && !text.is_empty()
                {
                    content.push_str(text);
                    yield StreamEvent::Delta(text.to_string());
                }
                if let Some(total) = evt["usage"]["total_tokens"].as_u64() {
                    tokens_used = Some(total as u32);
                }
            }
        }

        yield StreamEvent::Done(ChatResponse {
            content,
            model,
            tokens_used,
        });
    })
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn is_available(&self) -> bool {
        !self.api_key.expose_secret().is_empty()
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(OPENAI_MODELS
            .iter()
            .map(|(id, name, caps)| ModelInfo {
                id: (*id).into(),
                name: (*name).into(),
                provider: self.name().into(),
                capabilities: caps.to_vec(),
                size: None,
            })
            .collect())
    }

    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> anyhow::Result<ChatResponse> {
        let body = serde_json::json!({
            "model": model,
            "messages": to_openai_messages(messages),
        });
        debug!(model, "openai chat request");
        chat_completions(self.request(&body), model).await
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
        debug!(model = %model, "openai stream request");
        stream_completions(self.request(&body), model)
    }
}
