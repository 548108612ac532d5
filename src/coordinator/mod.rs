use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{error, info};

use crate::protocol::SessionEvent;
use crate::store::{BlobStore, ChunkRecord, MetadataStore, Session, SessionStatus, StoreError};

/// Provisional result written by the fast-path finalize in [`mark_stopped`],
/// later overwritten by the background worker.
///
/// [`mark_stopped`]: SessionCoordinator::mark_stopped
pub const PROVISIONAL_TRANSCRIPT: &str = "Stub transcript (transcription pending).";
pub const PROVISIONAL_SUMMARY: &str = "Summary not generated (transcription pending).";

/// Errors surfaced as negative acknowledgements on the ingest path.
///
/// Validation errors are client errors: nothing is persisted and the server
/// never retries them. Storage errors map to negative acks the client may
/// retry.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("missing sessionId")]
    MissingSessionId,

    #[error("invalid seq {0}: must be >= 1")]
    InvalidSeq(u32),

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("blob write failed: {0}")]
    BlobWrite(String),

    #[error("metadata read failed: {0}")]
    MetadataRead(String),

    #[error("metadata write failed: {0}")]
    MetadataWrite(String),
}

impl IngestError {
    /// Whether the client may usefully retry the same chunk.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::BlobWrite(_) | IngestError::MetadataRead(_) | IngestError::MetadataWrite(_)
        )
    }
}

/// Server-side owner of session lifecycle and chunk existence.
///
/// Chunk payloads go to blob storage first, then metadata; status moves only
/// under a per-session lock so a late chunk or a slow worker can never drag
/// a session backward through its lifecycle.
pub struct SessionCoordinator {
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    events: broadcast::Sender<SessionEvent>,
    jobs: mpsc::Sender<String>,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionCoordinator {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        events: broadcast::Sender<SessionEvent>,
        jobs: mpsc::Sender<String>,
    ) -> Self {
        Self {
            store,
            blobs,
            events,
            jobs,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to session lifecycle events (processing, deltas, completed,
    /// processing-error).
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Create a session in `recording` status and return its id.
    pub async fn create_session(
        &self,
        title: &str,
        owner_id: Option<String>,
    ) -> anyhow::Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let title = if title.is_empty() { "Untitled" } else { title };

        let session = Session {
            id: id.clone(),
            owner_id: owner_id.clone(),
            title: title.to_string(),
            status: SessionStatus::Recording,
            transcript: None,
            summary: None,
            created_at: Utc::now(),
        };
        self.store.create_session(session).await?;

        info!(
            "created session {} user={}",
            id,
            owner_id.as_deref().unwrap_or("anonymous")
        );
        Ok(id)
    }

    /// Persist one chunk: blob write first, then the metadata row. A metadata
    /// failure after a successful blob write yields a negative ack with no
    /// rollback — an orphaned blob is acceptable, a metadata row pointing at
    /// a missing blob is not.
    ///
    /// Idempotent per `(session_id, seq)`: a duplicate retry overwrites the
    /// blob whole and leaves the metadata row equivalent.
    pub async fn ingest_chunk(
        &self,
        session_id: &str,
        seq: u32,
        mime_type: &str,
        start_time_ms: u64,
        payload: &[u8],
    ) -> Result<(), IngestError> {
        if session_id.is_empty() {
            return Err(IngestError::MissingSessionId);
        }
        if seq == 0 {
            return Err(IngestError::InvalidSeq(seq));
        }
        // A missing session is the client's mistake; anything else is the
        // store's, and the client may retry.
        self.store.session(session_id).await.map_err(|err| match err {
            StoreError::SessionNotFound(_) => IngestError::UnknownSession(session_id.to_string()),
            other => IngestError::MetadataRead(other.to_string()),
        })?;

        let filename = self
            .blobs
            .put(session_id, seq, payload)
            .await
            .map_err(|e| IngestError::BlobWrite(format!("{e:#}")))?;

        let chunk = ChunkRecord {
            session_id: session_id.to_string(),
            seq,
            filename: Some(filename),
            text: None,
            created_at: Utc::now(),
        };
        self.store
            .insert_chunk(chunk)
            .await
            .map_err(|e| IngestError::MetadataWrite(e.to_string()))?;

        info!(
            "stored chunk session={} seq={} mime={} bytes={}",
            session_id,
            seq,
            mime_type,
            payload.len()
        );

        // Placeholder live-feedback signal while no real transcription has
        // run for this chunk yet; the worker produces the authoritative text.
        self.emit(SessionEvent::TranscriptDelta {
            session_id: session_id.to_string(),
            seq,
            text: format!("Stub transcript for chunk {seq}"),
            start_ms: start_time_ms,
            end_ms: start_time_ms + 15_000,
        });

        Ok(())
    }

    /// Handle end-of-recording: transition to `processing`, fast-path
    /// finalize with a provisional result so the client's fallback timer is
    /// rarely needed, then enqueue the session for background reprocessing
    /// without blocking the ack.
    pub async fn mark_stopped(&self, session_id: &str) -> anyhow::Result<()> {
        if session_id.is_empty() {
            anyhow::bail!("missing sessionId");
        }

        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let session = self.store.session(session_id).await?;
        if session.status.is_terminal() {
            // Duplicate stop: re-emit the terminal event instead of walking
            // the lifecycle again.
            info!("session {} already {:?}", session_id, session.status);
            self.emit_terminal(&session);
            return Ok(());
        }

        self.store
            .update_status(session_id, SessionStatus::Processing)
            .await?;
        self.emit(SessionEvent::Processing {
            session_id: session_id.to_string(),
        });

        self.store
            .finalize_session(
                session_id,
                PROVISIONAL_TRANSCRIPT,
                PROVISIONAL_SUMMARY,
                SessionStatus::Completed,
            )
            .await?;
        self.emit(SessionEvent::Completed {
            session_id: session_id.to_string(),
            transcript: PROVISIONAL_TRANSCRIPT.to_string(),
            summary: PROVISIONAL_SUMMARY.to_string(),
            download_url: download_url(session_id),
        });

        info!("session {} completed (fast path)", session_id);

        // Background reprocessing must not block or fail the ack.
        if let Err(err) = self.jobs.try_send(session_id.to_string()) {
            error!(
                "failed to enqueue session {} for reprocessing: {}",
                session_id, err
            );
        }

        Ok(())
    }

    fn emit_terminal(&self, session: &Session) {
        match session.status {
            SessionStatus::Completed => self.emit(SessionEvent::Completed {
                session_id: session.id.clone(),
                transcript: session.transcript.clone().unwrap_or_default(),
                summary: session.summary.clone().unwrap_or_default(),
                download_url: download_url(&session.id),
            }),
            SessionStatus::Error => self.emit(SessionEvent::ProcessingError {
                session_id: session.id.clone(),
                error: "processing failed".to_string(),
            }),
            _ => {}
        }
    }

    fn emit(&self, event: SessionEvent) {
        // Best-effort fan-out; no connected listeners is fine.
        let _ = self.events.send(event);
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Download location for a session's exported transcript.
pub fn download_url(session_id: &str) -> String {
    format!("/sessions/{session_id}/download")
}
