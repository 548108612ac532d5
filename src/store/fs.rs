use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use super::{ChunkRecord, MetadataStore, Session, SessionStatus, StoreError, StoreResult};

/// File-backed metadata store: one directory per session holding
/// `session.json` and `chunks.json`. This is what the `serve` and `process`
/// subcommands share, so a standalone worker run sees the same rows the
/// server wrote.
///
/// All operations are read-modify-write under one lock; per-session write
/// ordering on top of that is the coordinator's job.
pub struct FsMetadataStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FsMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        info!("metadata store initialized at {:?}", root);
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.root.join(id).join("session.json")
    }

    fn chunks_path(&self, id: &str) -> PathBuf {
        self.root.join(id).join("chunks.json")
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Unavailable(err.to_string())),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::Unavailable(format!("no parent dir for {path:?}")))?;
        fs::create_dir_all(parent).map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let bytes =
            serde_json::to_vec_pretty(value).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn load_session(&self, id: &str) -> StoreResult<Session> {
        Self::read_json(&self.session_path(id))?
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
    }

    fn load_chunks(&self, id: &str) -> StoreResult<Vec<ChunkRecord>> {
        Ok(Self::read_json(&self.chunks_path(id))?.unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl MetadataStore for FsMetadataStore {
    async fn create_session(&self, session: Session) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        Self::write_json(&self.session_path(&session.id), &session)
    }

    async fn session(&self, id: &str) -> StoreResult<Session> {
        let _guard = self.lock.lock().await;
        self.load_session(id)
    }

    async fn update_status(&self, id: &str, status: SessionStatus) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut session = self.load_session(id)?;

        if !session.status.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                from: session.status,
                to: status,
            });
        }

        session.status = status;
        Self::write_json(&self.session_path(id), &session)
    }

    async fn insert_chunk(&self, chunk: ChunkRecord) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        // FK discipline: the session row must exist first.
        self.load_session(&chunk.session_id)?;

        let mut chunks = self.load_chunks(&chunk.session_id)?;
        match chunks.iter_mut().find(|c| c.seq == chunk.seq) {
            // Duplicate delivery: replace the blob reference, keep any text.
            Some(existing) => existing.filename = chunk.filename.clone(),
            None => {
                chunks.push(chunk.clone());
                chunks.sort_by_key(|c| c.seq);
            }
        }
        Self::write_json(&self.chunks_path(&chunk.session_id), &chunks)
    }

    async fn chunks_ordered(&self, session_id: &str) -> StoreResult<Vec<ChunkRecord>> {
        let _guard = self.lock.lock().await;
        let mut chunks = self.load_chunks(session_id)?;
        chunks.sort_by_key(|c| c.seq);
        Ok(chunks)
    }

    async fn set_chunk_text(&self, session_id: &str, seq: u32, text: &str) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut chunks = self.load_chunks(session_id)?;
        let chunk = chunks
            .iter_mut()
            .find(|c| c.seq == seq)
            .ok_or_else(|| StoreError::ChunkNotFound {
                session_id: session_id.to_string(),
                seq,
            })?;

        chunk.text = Some(text.to_string());
        Self::write_json(&self.chunks_path(session_id), &chunks)
    }

    async fn finalize_session(
        &self,
        id: &str,
        transcript: &str,
        summary: &str,
        status: SessionStatus,
    ) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut session = self.load_session(id)?;

        if !session.status.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                from: session.status,
                to: status,
            });
        }

        session.transcript = Some(transcript.to_string());
        session.summary = Some(summary.to_string());
        session.status = status;
        Self::write_json(&self.session_path(id), &session)
    }
}
