//! Chat orchestration: capability resolution, provider streaming, and
//! cancellation.

use std::sync::Arc;

use {
    tokio::sync::mpsc, tokio_stream::StreamExt, tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use {
    hearth_protocol::{Capability, ChatMessage},
    hearth_providers::{CapabilitySlot, StreamEvent},
};

use crate::state::GatewayState;

/// Events delivered to the connection driving one chat request.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Token(String),
    Done {
        content: String,
        model: String,
        tokens_used: Option<u32>,
    },
    Error(String),
}

/// Walk the capability's fallback chain and return the first slot whose
/// provider reports itself available. Fallback happens here, before the
/// request starts; a provider that fails mid-stream is not retried.
async fn pick_slot(state: &GatewayState, capability: Capability) -> Result<CapabilitySlot, String> {
    let chain = state.registry.resolve_chain(capability);
    if chain.is_empty() {
        return Err(format!("no provider assigned for capability '{capability}'"));
    }
    for slot in chain {
        if slot.provider.is_available().await {
            return Ok(slot);
        }
    }
    Err(format!("no available provider for capability '{capability}'"))
}

/// Start a streaming chat. Events arrive on the returned receiver; the
/// last one is always `Done` or `Error`. Cancelling the token drops the
/// provider stream (aborting the upstream request) and finishes with a
/// `Done` carrying whatever content had arrived.
pub fn stream_chat(
    state: Arc<GatewayState>,
    capability: Capability,
    messages: Vec<ChatMessage>,
    cancel: CancellationToken,
) -> mpsc::Receiver<ChatEvent> {
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        let slot = match pick_slot(&state, capability).await {
            Ok(slot) => slot,
            Err(message) => {
                warn!(capability = %capability, %message, "chat request unroutable");
                let _ = tx.send(ChatEvent::Error(message)).await;
                return;
            },
        };

        debug!(
            capability = %capability,
            provider = slot.provider_name(),
            model = %slot.model,
            "chat stream starting"
        );

        let provider = Arc::clone(&slot.provider);
        let mut stream = provider.chat_stream(slot.model.clone(), messages);
        let mut partial = String::new();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(model = %slot.model, "chat stream cancelled");
                    let _ = tx
                        .send(ChatEvent::Done {
                            content: partial,
                            model: slot.model.clone(),
                            tokens_used: None,
                        })
                        .await;
                    return;
                },
                event = stream.next() => event,
            };

            match event {
                Some(StreamEvent::Delta(token)) => {
                    partial.push_str(&token);
                    if tx.send(ChatEvent::Token(token)).await.is_err() {
                        return;
                    }
                },
                Some(StreamEvent::Done(resp)) => {
                    let _ = tx
                        .send(ChatEvent::Done {
                            content: resp.content,
                            model: resp.model,
                            tokens_used: resp.tokens_used,
                        })
                        .await;
                    return;
                },
                Some(StreamEvent::Error(message)) => {
                    warn!(model = %slot.model, %message, "chat stream failed");
                    let _ = tx.send(ChatEvent::Error(message)).await;
                    return;
                },
                // Provider stream ended without a terminal event.
                None => {
                    let _ = tx
                        .send(ChatEvent::Done {
                            content: partial,
                            model: slot.model.clone(),
                            tokens_used: None,
                        })
                        .await;
                    return;
                },
            }
        }
    });

    rx
}
