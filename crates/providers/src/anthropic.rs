//! Anthropic Messages API provider.

use std::pin::Pin;

use {
    async_trait::async_trait, futures::StreamExt, secrecy::ExposeSecret, tokio_stream::Stream,
};

use tracing::{debug, warn};

use crate::{Capability, ChatMessage, ChatResponse, LlmProvider, ModelInfo, Role, StreamEvent};

/// Known Claude models. Current models first.
const ANTHROPIC_MODELS: &[(&str, &str, &[Capability])] = &[
    (
        "claude-sonnet-4-5-20250929",
        "Claude Sonnet 4.5",
        &[Capability::Language, Capability::Vision],
    ),
    (
        "claude-haiku-4-5-20251001",
        "Claude Haiku 4.5",
        &[Capability::Language, Capability::Vision],
    ),
    (
        "claude-opus-4-1-20250805",
        "Claude Opus 4.1",
        &[Capability::Language, Capability::Reasoning, Capability::Vision],
    ),
];

pub struct AnthropicProvider {
    api_key: secrecy::Secret<String>,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: secrecy::Secret<String>) -> Self {
        Self::with_base_url(api_key, "https://api.anthropic.com".into())
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
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(body)
    }
}

/// Convert a message history to Anthropic format.
///
/// Returns `(system_text, messages)`: system messages are lifted to the
/// top-level `system` field, images become base64 content blocks.
fn to_anthropic_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<serde_json::Value>) {
    let mut system_text: Option<String> = None;
    let mut out = Vec::new();

    for msg in messages {
        let role = match msg.role {
            Role::System => {
                system_text = Some(match system_text {
                    Some(existing) => format!("{existing}\n\n{}", msg.content),
                    None => msg.content.clone(),
                });
                continue;
            },
            Role::User => "user",
            Role::Assistant => "assistant",
        };

        match msg.images.as_deref() {
            Some(images) if !images.is_empty() => {
                let mut blocks = vec![serde_json::json!({"type": "text", "text": msg.content})];
                for data in images {
                    blocks.push(serde_json::json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": "image/jpeg",
                            "data": data,
                        }
                    }));
                }
                out.push(serde_json::json!({"role": role, "content": blocks}));
            },
            _ => out.push(serde_json::json!({"role": role, "content": msg.content})),
        }
    }

    (system_text, out)
}

fn usage_total(usage: &serde_json::Value) -> Option<u32> {
    let input = usage["input_tokens"].as_u64();
    let output = usage["output_tokens"].as_u64();
    match (input, output) {
        (None, None) => None,
        (i, o) => Some((i.unwrap_or(0) + o.unwrap_or(0)) as u32),
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "claude"
    }

    async fn is_available(&self) -> bool {
        !self.api_key.expose_secret().is_empty()
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(ANTHROPIC_MODELS
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
        let (system_text, anthropic_messages) = to_anthropic_messages(messages);

        let mut body = serde_json::json!({
            "model": model,
            "max_tokens": 4096,
            "messages": anthropic_messages,
        });
        if let Some(ref sys) = system_text {
            body["system"] = serde_json::Value::String(sys.clone());
        }

        debug!(model, messages_count = anthropic_messages.len(), "anthropic chat request");

        let http_resp = self.request(&body).send().await?;
        let status = http_resp.status();
        if !status.is_success() {
            let body_text = http_resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body_text, "anthropic API error");
            anyhow::bail!("Anthropic API error HTTP {status}: {body_text}");
        }

        let resp = http_resp.json::<serde_json::Value>().await?;
        let content = resp["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| {
                        (b["type"].as_str() == Some("text"))
                            .then(|| b["text"].as_str().unwrap_or(""))
                    })
                    .collect::<String>()
            })
            .unwrap_or_default();

        Ok(ChatResponse {
            content,
            model: model.to_string(),
            tokens_used: usage_total(&resp["usage"]),
        })
    }

    fn chat_stream(
        &self,
        model: String,
        messages: Vec<ChatMessage>,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
        Box::pin(async_stream::stream! {
            let (system_text, anthropic_messages) = to_anthropic_messages(&messages);

            let mut body = serde_json::json!({
                "model": model,
                "max_tokens": 4096,
                "messages": anthropic_messages,
                "stream": true,
            });
            if let Some(ref sys) = system_text {
                body["system"] = serde_json::Value::String(sys.clone());
            }

            debug!(model = %model, messages_count = anthropic_messages.len(), "anthropic stream request");

            let resp = match self.request(&body).send().await {
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
            let mut input_tokens: u64 = 0;
            let mut output_tokens: u64 = 0;

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield StreamEvent::Error(e.to_string());
                        return;
                    },
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are separated by blank lines.
                while let Some(pos) = buf.find("\n\n") {
                    let block = buf[..pos].to_string();
                    buf = buf[pos + 2..].to_string();

                    for line in block.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        let Ok(evt) = serde_json::from_str::<serde_json::Value>(data) else {
                            continue;
                        };
                        match evt["type"].as_str().unwrap_or("") {
                            "content_block_delta" => {
                                if evt["delta"]["type"].as_str() == Some("text_delta")
                                    && let Some(text) = evt["delta"]["text"].as_str()
                                    && !text.is_empty()
                                {
                                    content.push_str(text);
                                    yield StreamEvent::Delta(text.to_string());
                                }
                            },
                            "message_start" => {
                                if let Some(v) = evt["message"]["usage"]["input_tokens"].as_u64() {
                                    input_tokens = v;
                                }
                            },
                            "message_delta" => {
                                if let Some(v) = evt["usage"]["output_tokens"].as_u64() {
                                    output_tokens = v;
                                }
                            },
                            "message_stop" => {
                                let tokens = input_tokens + output_tokens;
                                yield StreamEvent::Done(ChatResponse {
                                    content: std::mem::take(&mut content),
                                    model: model.clone(),
                                    tokens_used: (tokens > 0).then_some(tokens as u32),
                                });
                                return;
                            },
                            "error" => {
                                let msg = evt["error"]["message"]
                                    .as_str()
                                    .unwrap_or("unknown error");
                                yield StreamEvent::Error(msg.to_string());
                                return;
                            },
                            _ => {},
                        }
                    }
                }
            }

            // Upstream closed without message_stop: still emit one terminal.
            yield StreamEvent::Done(ChatResponse {
                content,
                model: model.clone(),
                tokens_used: None,
            });
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn provider(base_url: String) -> AnthropicProvider {
        AnthropicProvider::with_base_url(secrecy::Secret::new("key".into()), base_url)
    }

    #[test]
    fn system_messages_are_lifted() {
        let (system, msgs) = to_anthropic_messages(&[
            ChatMessage::system("be brief"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ]);
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["role"], "user");
        assert_eq!(msgs[1]["role"], "assistant");
    }

    #[test]
    fn images_become_base64_blocks() {
        let mut msg = ChatMessage::user("what is this");
        msg.images = Some(vec!["abc123".into()]);
        let (_, msgs) = to_anthropic_messages(&[msg]);
        let blocks = msgs[0]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1]["type"], "image");
        assert_eq!(blocks[1]["source"]["data"], "abc123");
    }

    #[tokio::test]
    async fn chat_parses_content_and_usage() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "key")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "content": [{"type": "text", "text": "hello there"}],
                    "usage": {"input_tokens": 10, "output_tokens": 5}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let resp = provider(server.url())
            .chat("claude-test", &[ChatMessage::user("hi")])
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(resp.content, "hello there");
        assert_eq!(resp.tokens_used, Some(15));
    }

    #[tokio::test]
    async fn stream_yields_deltas_then_done() {
        let mut server = mockito::Server::new_async().await;
        let sse = concat!(
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":3}}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":2}}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_body(sse)
            .create_async()
            .await;

        let p = provider(server.url());
        let events: Vec<StreamEvent> = p
            .chat_stream("claude-test".into(), vec![ChatMessage::user("hi")])
            .collect()
            .await;

        assert!(matches!(&events[0], StreamEvent::Delta(t) if t == "Hel"));
        assert!(matches!(&events[1], StreamEvent::Delta(t) if t == "lo"));
        match &events[2] {
            StreamEvent::Done(resp) => {
                assert_eq!(resp.content, "Hello");
                assert_eq!(resp.tokens_used, Some(5));
            },
            other => panic!("expected Done, got {other:?}"),
        }
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn stream_surfaces_http_error_as_single_terminal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let p = provider(server.url());
        let events: Vec<StreamEvent> = p
            .chat_stream("claude-test".into(), vec![ChatMessage::user("hi")])
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error(msg) if msg.contains("500")));
    }
}
