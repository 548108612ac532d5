use std::collections::{BTreeMap, HashMap};

use tokio::sync::RwLock;

use super::{ChunkRecord, MetadataStore, Session, SessionStatus, StoreError, StoreResult};

/// In-process metadata store. Chunks live in a per-session `BTreeMap` keyed
/// by `seq`, so seq-ordered reads fall out of the key order.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<String, Session>,
    chunks: HashMap<String, BTreeMap<u32, ChunkRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MetadataStore for MemoryStore {
    async fn create_session(&self, session: Session) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn session(&self, id: &str) -> StoreResult<Session> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
    }

    async fn update_status(&self, id: &str, status: SessionStatus) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;

        if !session.status.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                from: session.status,
                to: status,
            });
        }

        session.status = status;
        Ok(())
    }

    async fn insert_chunk(&self, chunk: ChunkRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(&chunk.session_id) {
            return Err(StoreError::SessionNotFound(chunk.session_id.clone()));
        }

        let by_seq = inner.chunks.entry(chunk.session_id.clone()).or_default();
        match by_seq.get_mut(&chunk.seq) {
            // Duplicate delivery for a seq already on record: replace the
            // blob reference, keep any text the worker has written.
            Some(existing) => {
                existing.filename = chunk.filename;
            }
            None => {
                by_seq.insert(chunk.seq, chunk);
            }
        }
        Ok(())
    }

    async fn chunks_ordered(&self, session_id: &str) -> StoreResult<Vec<ChunkRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .chunks
            .get(session_id)
            .map(|by_seq| by_seq.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_chunk_text(&self, session_id: &str, seq: u32, text: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let chunk = inner
            .chunks
            .get_mut(session_id)
            .and_then(|by_seq| by_seq.get_mut(&seq))
            .ok_or_else(|| StoreError::ChunkNotFound {
                session_id: session_id.to_string(),
                seq,
            })?;

        chunk.text = Some(text.to_string());
        Ok(())
    }

    async fn finalize_session(
        &self,
        id: &str,
        transcript: &str,
        summary: &str,
        status: SessionStatus,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;

        if !session.status.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                from: session.status,
                to: status,
            });
        }

        session.transcript = Some(transcript.to_string());
        session.summary = Some(summary.to_string());
        session.status = status;
        Ok(())
    }
}
