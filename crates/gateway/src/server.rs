//! Router assembly and the REST surface.
//!
//! Response bodies use a uniform envelope: `{"ok": true, "data": …}` on
//! success, `{"ok": false, "error": …}` on failure.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Json, Router,
        extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade},
        http::StatusCode,
        middleware::Next,
        response::{IntoResponse, Response},
        routing::{delete, get, post},
    },
    serde::{Deserialize, Serialize},
    tower_http::{cors::CorsLayer, trace::TraceLayer},
    tracing::{info, warn},
};

use hearth_protocol::Capability;

use crate::{state::GatewayState, ws};

// ── Envelope helpers ─────────────────────────────────────────────────────────

fn ok_json<T: Serialize>(data: T) -> Response {
    Json(serde_json::json!({ "ok": true, "data": data })).into_response()
}

fn err_json(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "ok": false, "error": message.into() })),
    )
        .into_response()
}

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_router(state: Arc<GatewayState>) -> Router {
    let protected = Router::new()
        .route("/me", get(me_handler))
        .route("/models", get(models_handler))
        .route("/models/slots", get(slots_handler))
        .route("/sessions", get(sessions_handler))
        .route("/sessions/{id}", delete(revoke_session_handler))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            require_auth,
        ));

    Router::new()
        .route("/status", get(status_handler))
        .route("/pair/create", post(pair_create_handler))
        .route("/pair", post(pair_handler))
        .route("/ws", get(ws_upgrade_handler))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Auth middleware ──────────────────────────────────────────────────────────

/// Session id of the authenticated caller, inserted by `require_auth`.
#[derive(Clone)]
pub struct SessionIdent(pub String);

fn bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn require_auth(
    State(state): State<Arc<GatewayState>>,
    mut request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(request.headers()) else {
        return err_json(StatusCode::UNAUTHORIZED, "missing bearer token");
    };
    match state.auth.validate_session(token).await {
        Ok(session_id) => {
            request.extensions_mut().insert(SessionIdent(session_id));
            next.run(request).await
        },
        Err(_) => err_json(StatusCode::UNAUTHORIZED, "not authenticated"),
    }
}

// ── Public handlers ──────────────────────────────────────────────────────────

async fn status_handler(State(state): State<Arc<GatewayState>>) -> Response {
    ok_json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

/// Pairing tokens can only be minted from the machine itself; the raw
/// token is shown out-of-band (terminal QR code) and never again.
async fn pair_create_handler(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if !addr.ip().is_loopback() {
        warn!(remote = %addr, "pairing-token request from non-loopback address");
        return err_json(StatusCode::FORBIDDEN, "pairing tokens are created locally");
    }
    let (token, expires_at) = state.auth.create_pairing_token();
    ok_json(serde_json::json!({ "token": token, "expiresAt": expires_at }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairRequest {
    token: String,
    #[serde(default)]
    device_name: Option<String>,
}

async fn pair_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<PairRequest>,
) -> Response {
    match state.auth.pair(&req.token, req.device_name.as_deref()).await {
        Ok(session_token) => ok_json(serde_json::json!({ "sessionToken": session_token })),
        Err(e) => err_json(StatusCode::UNAUTHORIZED, e.to_string()),
    }
}

// ── Protected handlers ───────────────────────────────────────────────────────

async fn me_handler(axum::Extension(ident): axum::Extension<SessionIdent>) -> Response {
    ok_json(serde_json::json!({ "sessionId": ident.0 }))
}

async fn models_handler(State(state): State<Arc<GatewayState>>) -> Response {
    let mut models = Vec::new();
    for provider in state.registry.providers() {
        if !provider.is_available().await {
            continue;
        }
        match provider.list_models().await {
            Ok(list) => models.extend(list),
            Err(e) => warn!(provider = provider.name(), error = %e, "model listing failed"),
        }
    }
    ok_json(models)
}

async fn slots_handler(State(state): State<Arc<GatewayState>>) -> Response {
    let summary = state.registry.slot_summary();
    let slots: serde_json::Map<String, serde_json::Value> = Capability::ALL
        .iter()
        .map(|cap| {
            let value = match summary.get(cap).and_then(|v| v.as_ref()) {
                Some((provider, model)) => {
                    serde_json::json!({ "provider": provider, "model": model })
                },
                None => serde_json::Value::Null,
            };
            (cap.as_str().to_string(), value)
        })
        .collect();
    ok_json(slots)
}

async fn sessions_handler(State(state): State<Arc<GatewayState>>) -> Response {
    match state.auth.sessions().list_active().await {
        Ok(rows) => ok_json(
            rows.iter()
                .map(|row| {
                    serde_json::json!({
                        "id": row.id,
                        "deviceName": row.device_name,
                        "createdAt": row.created_at,
                        "lastSeenAt": row.last_seen_at,
                    })
                })
                .collect::<Vec<_>>(),
        ),
        Err(e) => err_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn revoke_session_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Response {
    match state.auth.revoke_session(&id).await {
        Ok(()) => ok_json(serde_json::json!({ "revoked": id })),
        Err(e) => err_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ── WebSocket upgrade ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

/// Authentication happens before the upgrade: an invalid token gets a
/// plain 401 and no WebSocket.
async fn ws_upgrade_handler(
    State(state): State<Arc<GatewayState>>,
    headers: axum::http::HeaderMap,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let token = match bearer_token(&headers).map(str::to_string).or(query.token) {
        Some(t) => t,
        None => return err_json(StatusCode::UNAUTHORIZED, "missing session token"),
    };
    let session_id = match state.auth.validate_session(&token).await {
        Ok(id) => id,
        Err(_) => return err_json(StatusCode::UNAUTHORIZED, "not authenticated"),
    };

    info!(session_id = %session_id, "ws: connection authenticated");
    upgrade.on_upgrade(move |socket| ws::handle_connection(socket, state, session_id))
}
