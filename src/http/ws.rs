use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    http::HeaderMap,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::state::AppState;
use crate::protocol::{decode_payload, ClientMessage, ServerMessage};

/// GET /ws
/// Upgrade to the session wire protocol. The caller identity is derived
/// once here from the handshake credential (`Authorization: Bearer` header
/// or `token` query parameter) and threaded explicitly into every
/// coordinator call for this connection.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let credential = bearer_token(&headers).or_else(|| params.get("token").cloned());
    let owner_id = state.identity.verify(credential.as_deref());
    ws.on_upgrade(move |socket| handle_connection(socket, state, owner_id))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

async fn handle_connection(socket: WebSocket, state: AppState, owner_id: Option<String>) {
    info!(
        "client connected user={}",
        owner_id.as_deref().unwrap_or("anonymous")
    );

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(64);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Sessions addressed by this connection; lifecycle events for anything
    // else stay off this socket.
    let owned_sessions: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut events = state.coordinator.subscribe();
    let forwarder = {
        let out = out_tx.clone();
        let owned = Arc::clone(&owned_sessions);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if owned.lock().unwrap().contains(event.session_id())
                            && out.send(event.to_message()).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("event forwarder lagged; skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                handle_message(&text, &state, &owner_id, &owned_sessions, &out_tx).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    forwarder.abort();
    info!(
        "client disconnected user={}",
        owner_id.as_deref().unwrap_or("anonymous")
    );
}

async fn handle_message(
    text: &str,
    state: &AppState,
    owner_id: &Option<String>,
    owned_sessions: &Arc<Mutex<HashSet<String>>>,
    out: &mpsc::Sender<ServerMessage>,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            // No correlation id to reply to; reject by dropping.
            warn!("unparseable client message: {}", err);
            return;
        }
    };

    let reply = match message {
        ClientMessage::StartSession { title } => {
            match state
                .coordinator
                .create_session(&title, owner_id.clone())
                .await
            {
                Ok(session_id) => {
                    owned_sessions.lock().unwrap().insert(session_id.clone());
                    ServerMessage::SessionStarted {
                        ok: true,
                        session_id: Some(session_id),
                        error: None,
                    }
                }
                Err(err) => ServerMessage::SessionStarted {
                    ok: false,
                    session_id: None,
                    error: Some(format!("{err:#}")),
                },
            }
        }

        ClientMessage::AudioChunk {
            session_id,
            seq,
            mime_type,
            start_time_ms,
            payload,
        } => {
            // Register interest before ingesting so the delta event this
            // chunk triggers is forwarded here, including after a reconnect.
            owned_sessions.lock().unwrap().insert(session_id.clone());

            let outcome = match decode_payload(&payload) {
                Ok(bytes) => state
                    .coordinator
                    .ingest_chunk(&session_id, seq, &mime_type, start_time_ms, &bytes)
                    .await
                    .map_err(|e| e.to_string()),
                Err(err) => Err(format!("{err:#}")),
            };

            match outcome {
                Ok(()) => ServerMessage::ChunkAck {
                    ok: true,
                    seq,
                    error: None,
                },
                Err(error) => ServerMessage::ChunkAck {
                    ok: false,
                    seq,
                    error: Some(error),
                },
            }
        }

        ClientMessage::RecordingStopped { session_id } => {
            owned_sessions.lock().unwrap().insert(session_id.clone());

            match state.coordinator.mark_stopped(&session_id).await {
                Ok(()) => ServerMessage::StopAck {
                    ok: true,
                    error: None,
                },
                Err(err) => ServerMessage::StopAck {
                    ok: false,
                    error: Some(format!("{err:#}")),
                },
            }
        }
    };

    let _ = out.send(reply).await;
}
