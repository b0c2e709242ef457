//! Per-connection frame dispatcher.
//!
//! One task reads inbound frames, one writes outbound frames, and every
//! chat request or shell process runs concurrently in between. Outbound
//! events reuse the `id` of the frame that started them so the client
//! can demultiplex concurrent streams.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, Mutex},
};

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, stream::StreamExt},
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    hearth_protocol::{
        ChatCancelParams, ChatDonePayload, ChatErrorPayload, ChatSendParams, ChatTokenPayload,
        Frame, MAX_PAYLOAD_BYTES, ShellExecParams, ShellInputParams, ShellKillParams, types,
    },
    hearth_shell::{ShellEvent, ShellKey},
};

use crate::{
    chat::{ChatEvent, stream_chat},
    state::GatewayState,
};

type InflightChats = Arc<Mutex<HashMap<String, CancellationToken>>>;

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drive one authenticated WebSocket connection until it closes.
pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, session_id: String) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, session_id = %session_id, "ws: connection open");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

    // Write loop: the only task touching the socket's send half.
    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                debug!(conn_id = %write_conn_id, "ws: write loop closed");
                break;
            }
        }
    });

    let inflight: InflightChats = Arc::new(Mutex::new(HashMap::new()));

    while let Some(message) = ws_rx.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        if text.len() > MAX_PAYLOAD_BYTES {
            let _ = out_tx.send(Frame::error(String::new(), "payload too large"));
            continue;
        }

        let frame: Frame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = out_tx.send(Frame::error(String::new(), format!("malformed frame: {e}")));
                continue;
            },
        };

        match frame.r#type.as_str() {
            types::CHAT_SEND => {
                handle_chat_send(&state, &out_tx, &inflight, frame);
            },
            types::CHAT_CANCEL => match serde_json::from_value::<ChatCancelParams>(frame.payload) {
                Ok(params) => {
                    if let Some(cancel) = lock(&inflight).get(&params.id) {
                        debug!(conn_id = %conn_id, chat_id = %params.id, "ws: chat cancelled");
                        cancel.cancel();
                    }
                },
                Err(e) => {
                    let _ = out_tx.send(Frame::error(frame.id, format!("invalid chat.cancel: {e}")));
                },
            },
            types::SHELL_EXEC => match serde_json::from_value::<ShellExecParams>(frame.payload) {
                Ok(params) => {
                    // Each process gets its own channel so its frames keep
                    // the id of the exec that started it, even after the
                    // tab has been handed to a replacement.
                    let (proc_tx, proc_rx) = mpsc::unbounded_channel::<ShellEvent>();
                    let key = ShellKey::new(session_id.clone(), params.tab_id.clone());
                    state.shells.exec(
                        key,
                        params.command,
                        params.cwd.map(std::path::PathBuf::from),
                        proc_tx,
                    );
                    tokio::spawn(forward_shell_events(proc_rx, frame.id, out_tx.clone()));
                },
                Err(e) => {
                    let _ = out_tx.send(Frame::error(frame.id, format!("invalid shell.exec: {e}")));
                },
            },
            types::SHELL_INPUT => match serde_json::from_value::<ShellInputParams>(frame.payload) {
                Ok(params) => {
                    state
                        .shells
                        .send_input(&ShellKey::new(session_id.clone(), params.tab_id), &params.data);
                },
                Err(e) => {
                    let _ =
                        out_tx.send(Frame::error(frame.id, format!("invalid shell.input: {e}")));
                },
            },
            types::SHELL_KILL => match serde_json::from_value::<ShellKillParams>(frame.payload) {
                Ok(params) => {
                    state
                        .shells
                        .kill(&ShellKey::new(session_id.clone(), params.tab_id));
                },
                Err(e) => {
                    let _ = out_tx.send(Frame::error(frame.id, format!("invalid shell.kill: {e}")));
                },
            },
            other => {
                warn!(conn_id = %conn_id, r#type = other, "ws: unknown frame type");
                let _ = out_tx.send(Frame::error(frame.id, format!("unknown frame type: {other}")));
            },
        }
    }

    // Connection gone: stop in-flight chats and the session's shells.
    for (_, cancel) in lock(&inflight).drain() {
        cancel.cancel();
    }
    state.shells.cleanup(&session_id);
    write_handle.abort();
    info!(conn_id = %conn_id, session_id = %session_id, "ws: connection closed");
}

/// Frame one shell process's events, tagged with the correlation id of
/// the `shell.exec` that started it. The channel closes shortly after
/// the exit event, which ends the task.
async fn forward_shell_events(
    mut events: mpsc::UnboundedReceiver<ShellEvent>,
    request_id: String,
    out_tx: mpsc::UnboundedSender<Frame>,
) {
    while let Some(event) = events.recv().await {
        let (r#type, payload) = match event {
            ShellEvent::Output(payload) => (
                types::SHELL_OUTPUT,
                serde_json::to_value(&payload).unwrap_or_default(),
            ),
            ShellEvent::Exit(payload) => (
                types::SHELL_EXIT,
                serde_json::to_value(&payload).unwrap_or_default(),
            ),
        };
        if out_tx
            .send(Frame::new(r#type, request_id.clone(), payload))
            .is_err()
        {
            break;
        }
    }
}

fn handle_chat_send(
    state: &Arc<GatewayState>,
    out_tx: &mpsc::UnboundedSender<Frame>,
    inflight: &InflightChats,
    frame: Frame,
) {
    let params: ChatSendParams = match serde_json::from_value(frame.payload) {
        Ok(params) => params,
        Err(e) => {
            let _ = out_tx.send(Frame::error(frame.id, format!("invalid chat.send: {e}")));
            return;
        },
    };

    // A frame id identifies one in-flight chat; reusing it would orphan
    // the first stream's cancellation token.
    let cancel = CancellationToken::new();
    match lock(inflight).entry(frame.id.clone()) {
        Entry::Occupied(_) => {
            let _ = out_tx.send(Frame::error(frame.id, "chat request id already in flight"));
            return;
        },
        Entry::Vacant(slot) => {
            slot.insert(cancel.clone());
        },
    }

    let mut events = stream_chat(
        Arc::clone(state),
        params.capability,
        params.messages,
        cancel,
    );

    let out_tx = out_tx.clone();
    let inflight = Arc::clone(inflight);
    let request_id = frame.id;
    let conversation_id = params.conversation_id;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let frame = match event {
                ChatEvent::Token(token) => Frame::new(
                    types::CHAT_TOKEN,
                    request_id.clone(),
                    serde_json::to_value(&ChatTokenPayload {
                        conversation_id: conversation_id.clone(),
                        token,
                    })
                    .unwrap_or_default(),
                ),
                ChatEvent::Done {
                    content,
                    model,
                    tokens_used,
                } => Frame::new(
                    types::CHAT_DONE,
                    request_id.clone(),
                    serde_json::to_value(&ChatDonePayload {
                        conversation_id: conversation_id.clone(),
                        message_id: uuid::Uuid::new_v4().to_string(),
                        content,
                        model: Some(model),
                        tokens_used,
                    })
                    .unwrap_or_default(),
                ),
                ChatEvent::Error(message) => Frame::new(
                    types::CHAT_ERROR,
                    request_id.clone(),
                    serde_json::to_value(&ChatErrorPayload { message }).unwrap_or_default(),
                ),
            };
            if out_tx.send(frame).is_err() {
                break;
            }
        }
        lock(&inflight).remove(&request_id);
    });
}
