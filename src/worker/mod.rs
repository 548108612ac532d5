use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::coordinator::download_url;
use crate::protocol::SessionEvent;
use crate::store::{BlobStore, MetadataStore, SessionStatus, StoreError};

/// Black-box transcription collaborator. May fail per call; the worker
/// contains per-chunk failures as sentinel text.
#[async_trait::async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<String>;
}

/// Placeholder transcriber used until a real ASR backend is wired in.
pub struct StubTranscriber;

#[async_trait::async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        Ok(format!("Transcribed {} bytes of audio", audio.len()))
    }
}

/// Background transcription worker. Runs out-of-band from the request path:
/// consumes persisted chunks in `seq` order, transcribes each, and finalizes
/// the session row with the aggregated transcript and summary.
pub struct TranscriptionWorker {
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    transcriber: Arc<dyn Transcriber>,
    events: broadcast::Sender<SessionEvent>,
}

impl TranscriptionWorker {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        transcriber: Arc<dyn Transcriber>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            store,
            blobs,
            transcriber,
            events,
        }
    }

    /// Consume enqueued session ids until the queue closes. Failures are
    /// recorded against the session and never propagate to the sender side.
    pub async fn run(self: Arc<Self>, mut jobs: mpsc::Receiver<String>) {
        info!("transcription worker started");
        while let Some(session_id) = jobs.recv().await {
            if let Err(err) = self.process_session(&session_id).await {
                error!(
                    "background processing failed for session {}: {:#}",
                    session_id, err
                );
            }
        }
        info!("transcription worker stopped");
    }

    /// Process one session end to end. Idempotent: re-running on a session
    /// whose chunks already carry text reproduces the identical aggregate.
    pub async fn process_session(&self, session_id: &str) -> Result<()> {
        match self.run_once(session_id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.record_failure(session_id, &err).await;
                Err(err)
            }
        }
    }

    async fn run_once(&self, session_id: &str) -> Result<()> {
        info!("processing session {}", session_id);

        self.store
            .session(session_id)
            .await
            .with_context(|| format!("failed to load session {session_id}"))?;

        // Ordered by seq — arrival order is never trusted.
        let chunks = self
            .store
            .chunks_ordered(session_id)
            .await
            .context("failed to load chunks")?;

        let mut parts = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let text = match &chunk.text {
                Some(text) => text.clone(),
                None => {
                    let text = self.transcribe_chunk(session_id, chunk.seq, &chunk.filename).await;
                    // A failed text update costs one chunk, not the session.
                    if let Err(err) = self.store.set_chunk_text(session_id, chunk.seq, &text).await
                    {
                        warn!(
                            "failed to persist text for session={} seq={}: {}",
                            session_id, chunk.seq, err
                        );
                    }
                    text
                }
            };
            parts.push(format!("--- chunk {} ---\n{}", chunk.seq, text));
        }

        let transcript = parts.join("\n\n");
        let summary = format!(
            "Auto-generated summary stub: {} chunks processed.",
            parts.len()
        );

        self.store
            .finalize_session(session_id, &transcript, &summary, SessionStatus::Completed)
            .await
            .context("failed to finalize session")?;

        let _ = self.events.send(SessionEvent::Completed {
            session_id: session_id.to_string(),
            transcript,
            summary,
            download_url: download_url(session_id),
        });

        info!("session {} processed", session_id);
        Ok(())
    }

    async fn transcribe_chunk(
        &self,
        session_id: &str,
        seq: u32,
        filename: &Option<String>,
    ) -> String {
        let Some(filename) = filename else {
            return format!("[no audio available for chunk {seq}]");
        };

        let audio = match self.blobs.get(session_id, filename).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return format!("[no audio available for chunk {seq}]"),
            Err(err) => {
                warn!(
                    "blob read failed for session={} seq={}: {:#}",
                    session_id, seq, err
                );
                return format!("[no audio available for chunk {seq}]");
            }
        };

        match self.transcriber.transcribe(&audio).await {
            Ok(text) => text,
            Err(err) => {
                error!(
                    "transcription failed for session={} seq={}: {:#}",
                    session_id, seq, err
                );
                format!("[failed to transcribe chunk {seq}]")
            }
        }
    }

    /// Move the session to terminal `error` so it never sits in `processing`
    /// indefinitely. A session the fast path already completed keeps its
    /// provisional result; the failure is only logged.
    async fn record_failure(&self, session_id: &str, err: &anyhow::Error) {
        match self
            .store
            .update_status(session_id, SessionStatus::Error)
            .await
        {
            Ok(()) => {
                let _ = self.events.send(SessionEvent::ProcessingError {
                    session_id: session_id.to_string(),
                    error: format!("{err:#}"),
                });
            }
            Err(StoreError::IllegalTransition { from, .. }) => {
                warn!(
                    "session {} already {:?}; keeping existing result after background failure",
                    session_id, from
                );
            }
            Err(store_err) => {
                error!(
                    "failed to record error status for session {}: {}",
                    session_id, store_err
                );
            }
        }
    }
}
