use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, oneshot};

use crate::coordinator::SessionCoordinator;
use crate::protocol::{ChunkAck, SessionEvent};

/// Metadata accompanying one chunk payload on the wire.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub session_id: String,
    pub seq: u32,
    pub mime_type: String,
    pub start_time_ms: u64,
}

/// Client view of the session wire protocol.
///
/// Acknowledgement-style throughout: `start_session` and `send_stopped`
/// round-trip before returning; `send_chunk` returns immediately with a
/// receiver that resolves when the server acks that chunk, so waiting on one
/// ack never blocks transmission of other chunks.
#[async_trait::async_trait]
pub trait SessionTransport: Send + Sync {
    /// Create a server-side session; resolves to its id.
    async fn start_session(&self, title: &str) -> Result<String>;

    /// Transmit one chunk. A dropped receiver counts as a missing ack.
    async fn send_chunk(
        &self,
        meta: ChunkMeta,
        payload: Vec<u8>,
    ) -> Result<oneshot::Receiver<ChunkAck>>;

    /// Signal end-of-session; resolves on the server's ack, which does not
    /// imply the session completed.
    async fn send_stopped(&self, session_id: &str) -> Result<()>;

    /// Subscribe to server-pushed session events.
    fn events(&self) -> broadcast::Receiver<SessionEvent>;
}

/// In-process loopback transport: hands messages straight to a
/// [`SessionCoordinator`], exactly as the WebSocket endpoint would.
pub struct LocalTransport {
    coordinator: Arc<SessionCoordinator>,
    owner_id: Option<String>,
}

impl LocalTransport {
    pub fn new(coordinator: Arc<SessionCoordinator>, owner_id: Option<String>) -> Self {
        Self {
            coordinator,
            owner_id,
        }
    }
}

#[async_trait::async_trait]
impl SessionTransport for LocalTransport {
    async fn start_session(&self, title: &str) -> Result<String> {
        self.coordinator
            .create_session(title, self.owner_id.clone())
            .await
    }

    async fn send_chunk(
        &self,
        meta: ChunkMeta,
        payload: Vec<u8>,
    ) -> Result<oneshot::Receiver<ChunkAck>> {
        let (tx, rx) = oneshot::channel();
        let coordinator = Arc::clone(&self.coordinator);

        tokio::spawn(async move {
            let ack = match coordinator
                .ingest_chunk(
                    &meta.session_id,
                    meta.seq,
                    &meta.mime_type,
                    meta.start_time_ms,
                    &payload,
                )
                .await
            {
                Ok(()) => ChunkAck::accepted(meta.seq),
                Err(err) => ChunkAck::rejected(meta.seq, err.to_string()),
            };
            let _ = tx.send(ack);
        });

        Ok(rx)
    }

    async fn send_stopped(&self, session_id: &str) -> Result<()> {
        self.coordinator.mark_stopped(session_id).await
    }

    fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.coordinator.subscribe()
    }
}
