mod blob;
mod fs;
mod memory;

pub use blob::{chunk_filename, BlobStore, FsBlobStore};
pub use fs::FsMetadataStore;
pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session lifecycle status. The lifecycle is monotone:
/// `recording → processing → {completed | error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Recording,
    Processing,
    Completed,
    Error,
}

impl SessionStatus {
    fn rank(self) -> u8 {
        match self {
            SessionStatus::Recording => 0,
            SessionStatus::Processing => 1,
            SessionStatus::Completed | SessionStatus::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Error)
    }

    /// A status may be re-applied (idempotent rewrite, e.g. the background
    /// worker overwriting a fast-path result) or advanced, never reverted.
    /// One terminal state never flips to the other.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
    }
}

/// One recorded session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner_id: Option<String>,
    pub title: String,
    pub status: SessionStatus,
    pub transcript: Option<String>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Metadata for one persisted audio chunk. `filename` points into blob
/// storage; `text` is written later, exclusively by the transcription worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub session_id: String,
    pub seq: u32,
    pub filename: Option<String>,
    pub text: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("chunk seq={seq} not found for session {session_id}")]
    ChunkNotFound { session_id: String, seq: u32 },

    #[error("illegal status transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable metadata store for sessions and chunks.
///
/// Implementations must expose chunks ordered by ascending `seq` — the
/// worker's aggregation order comes from here, never from arrival order —
/// and must reject status transitions that move the lifecycle backward.
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_session(&self, session: Session) -> StoreResult<()>;

    async fn session(&self, id: &str) -> StoreResult<Session>;

    /// Monotone-guarded status update.
    async fn update_status(&self, id: &str, status: SessionStatus) -> StoreResult<()>;

    /// Upsert by `(session_id, seq)`. A duplicate insert for an already
    /// persisted seq replaces the filename but keeps any transcribed text.
    async fn insert_chunk(&self, chunk: ChunkRecord) -> StoreResult<()>;

    /// All chunks for a session, ordered by ascending `seq`.
    async fn chunks_ordered(&self, session_id: &str) -> StoreResult<Vec<ChunkRecord>>;

    async fn set_chunk_text(&self, session_id: &str, seq: u32, text: &str) -> StoreResult<()>;

    /// Atomically write transcript, summary and status in one update.
    async fn finalize_session(
        &self,
        id: &str,
        transcript: &str,
        summary: &str,
        status: SessionStatus,
    ) -> StoreResult<()>;
}
