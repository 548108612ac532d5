use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use super::transport::{ChunkMeta, SessionTransport};
use crate::protocol::{encode_payload, ChunkAck, ClientMessage, ServerMessage, SessionEvent};

/// Bounded reconnect attempts while establishing the connection.
const CONNECT_ATTEMPTS: usize = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// WebSocket client transport for the session wire protocol.
///
/// One writer task serializes outbound messages; one reader task correlates
/// acknowledgements (`chunk-ack` by seq, session/stop acks as
/// one-outstanding-per-connection) and fans server events out to
/// subscribers. If the connection drops, every pending ack sender is
/// released, which the uploader observes as missing acknowledgements.
pub struct WsTransport {
    outbound: mpsc::Sender<ClientMessage>,
    pending: Arc<Mutex<PendingAcks>>,
    events: broadcast::Sender<SessionEvent>,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

#[derive(Default)]
struct PendingAcks {
    start: Option<oneshot::Sender<Result<String, String>>>,
    stop: Option<oneshot::Sender<Result<(), String>>>,
    chunks: HashMap<u32, oneshot::Sender<ChunkAck>>,
}

impl WsTransport {
    /// Connect to the server's `/ws` endpoint, carrying the optional
    /// credential in the handshake. Identity is attached server-side; it is
    /// never sent in individual messages.
    pub async fn connect(url: &str, credential: Option<&str>) -> Result<Self> {
        let url = match credential {
            Some(token) => format!("{url}?token={token}"),
            None => url.to_string(),
        };

        let mut attempt = 0;
        let stream = loop {
            attempt += 1;
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => break stream,
                Err(err) if attempt < CONNECT_ATTEMPTS => {
                    warn!("connect attempt {} failed: {}; retrying", attempt, err);
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(err) => return Err(err).context("websocket connect failed"),
            }
        };
        info!("connected to {}", url);

        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<ClientMessage>(64);
        let (events, _) = broadcast::channel(256);
        let pending = Arc::new(Mutex::new(PendingAcks::default()));

        let writer_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let Ok(text) = serde_json::to_string(&message) else {
                    continue;
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_pending = Arc::clone(&pending);
        let reader_events = events.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!("websocket read failed: {}", err);
                        break;
                    }
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => dispatch(&reader_pending, &reader_events, message),
                    Err(err) => warn!("unparseable server message: {}", err),
                }
            }
            // Connection gone: dropping the pending senders surfaces every
            // outstanding ack as missing, feeding the uploader's retry path.
            let mut pending = reader_pending.lock().unwrap();
            pending.start.take();
            pending.stop.take();
            pending.chunks.clear();
        });

        Ok(Self {
            outbound,
            pending,
            events,
            writer_task,
            reader_task,
        })
    }
}

fn dispatch(
    pending: &Mutex<PendingAcks>,
    events: &broadcast::Sender<SessionEvent>,
    message: ServerMessage,
) {
    match message {
        ServerMessage::SessionStarted {
            ok,
            session_id,
            error,
        } => {
            if let Some(tx) = pending.lock().unwrap().start.take() {
                let result = if ok {
                    session_id.ok_or_else(|| "missing sessionId in ack".to_string())
                } else {
                    Err(error.unwrap_or_else(|| "start-session failed".to_string()))
                };
                let _ = tx.send(result);
            }
        }
        ServerMessage::ChunkAck { ok, seq, error } => {
            if let Some(tx) = pending.lock().unwrap().chunks.remove(&seq) {
                let _ = tx.send(ChunkAck { ok, seq, error });
            }
        }
        ServerMessage::StopAck { ok, error } => {
            if let Some(tx) = pending.lock().unwrap().stop.take() {
                let result = if ok {
                    Ok(())
                } else {
                    Err(error.unwrap_or_else(|| "recording-stopped failed".to_string()))
                };
                let _ = tx.send(result);
            }
        }
        ServerMessage::Processing { session_id } => {
            let _ = events.send(SessionEvent::Processing { session_id });
        }
        ServerMessage::TranscriptDelta {
            session_id,
            seq,
            text,
            start_ms,
            end_ms,
        } => {
            let _ = events.send(SessionEvent::TranscriptDelta {
                session_id,
                seq,
                text,
                start_ms,
                end_ms,
            });
        }
        ServerMessage::Completed {
            session_id,
            transcript,
            summary,
            download_url,
        } => {
            let _ = events.send(SessionEvent::Completed {
                session_id,
                transcript,
                summary,
                download_url,
            });
        }
        ServerMessage::ProcessingError { session_id, error } => {
            let _ = events.send(SessionEvent::ProcessingError { session_id, error });
        }
    }
}

#[async_trait::async_trait]
impl SessionTransport for WsTransport {
    async fn start_session(&self, title: &str) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().start = Some(tx);

        let message = ClientMessage::StartSession {
            title: title.to_string(),
        };
        if self.outbound.send(message).await.is_err() {
            self.pending.lock().unwrap().start.take();
            anyhow::bail!("connection closed");
        }

        match rx.await {
            Ok(Ok(session_id)) => Ok(session_id),
            Ok(Err(err)) => anyhow::bail!("start-session failed: {err}"),
            Err(_) => anyhow::bail!("connection closed before session ack"),
        }
    }

    async fn send_chunk(
        &self,
        meta: ChunkMeta,
        payload: Vec<u8>,
    ) -> Result<oneshot::Receiver<ChunkAck>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().chunks.insert(meta.seq, tx);

        let message = ClientMessage::AudioChunk {
            session_id: meta.session_id,
            seq: meta.seq,
            mime_type: meta.mime_type,
            start_time_ms: meta.start_time_ms,
            payload: encode_payload(&payload),
        };
        if self.outbound.send(message).await.is_err() {
            self.pending.lock().unwrap().chunks.remove(&meta.seq);
            anyhow::bail!("connection closed");
        }

        Ok(rx)
    }

    async fn send_stopped(&self, session_id: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().stop = Some(tx);

        let message = ClientMessage::RecordingStopped {
            session_id: session_id.to_string(),
        };
        if self.outbound.send(message).await.is_err() {
            self.pending.lock().unwrap().stop.take();
            anyhow::bail!("connection closed");
        }

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => anyhow::bail!("recording-stopped failed: {err}"),
            Err(_) => anyhow::bail!("connection closed before stop ack"),
        }
    }

    fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.writer_task.abort();
        self.reader_task.abort();
    }
}
