use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Messages sent from the uploader to the server.
///
/// Every client message expects an acknowledgement-style reply; the server
/// never assumes `audio-chunk` messages arrive in `seq` order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "start-session")]
    StartSession { title: String },

    #[serde(rename = "audio-chunk")]
    AudioChunk {
        #[serde(rename = "sessionId")]
        session_id: String,
        seq: u32,
        #[serde(rename = "mimeType")]
        mime_type: String,
        #[serde(rename = "startTimeMs")]
        start_time_ms: u64,
        /// Base64-encoded audio payload.
        payload: String,
    },

    #[serde(rename = "recording-stopped")]
    RecordingStopped {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

/// Messages sent from the server to the uploader: acknowledgements for the
/// three client messages plus server-pushed session events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session-started")]
    SessionStarted {
        ok: bool,
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "chunk-ack")]
    ChunkAck {
        ok: bool,
        seq: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Acks `recording-stopped`; does not imply the session completed.
    #[serde(rename = "stop-ack")]
    StopAck {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "processing")]
    Processing {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    #[serde(rename = "transcript-delta")]
    TranscriptDelta {
        #[serde(rename = "sessionId")]
        session_id: String,
        seq: u32,
        text: String,
        #[serde(rename = "startMs")]
        start_ms: u64,
        #[serde(rename = "endMs")]
        end_ms: u64,
    },

    #[serde(rename = "completed")]
    Completed {
        #[serde(rename = "sessionId")]
        session_id: String,
        transcript: String,
        summary: String,
        #[serde(rename = "downloadUrl")]
        download_url: String,
    },

    #[serde(rename = "processing-error")]
    ProcessingError {
        #[serde(rename = "sessionId")]
        session_id: String,
        error: String,
    },
}

/// Outcome of one `audio-chunk` delivery, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAck {
    pub ok: bool,
    pub seq: u32,
    pub error: Option<String>,
}

impl ChunkAck {
    pub fn accepted(seq: u32) -> Self {
        Self {
            ok: true,
            seq,
            error: None,
        }
    }

    pub fn rejected(seq: u32, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            seq,
            error: Some(error.into()),
        }
    }
}

/// Server-pushed session lifecycle events, fanned out to every connection
/// that owns the session. Carried over the wire as the event variants of
/// [`ServerMessage`].
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Processing {
        session_id: String,
    },
    TranscriptDelta {
        session_id: String,
        seq: u32,
        text: String,
        start_ms: u64,
        end_ms: u64,
    },
    Completed {
        session_id: String,
        transcript: String,
        summary: String,
        download_url: String,
    },
    ProcessingError {
        session_id: String,
        error: String,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Processing { session_id }
            | SessionEvent::TranscriptDelta { session_id, .. }
            | SessionEvent::Completed { session_id, .. }
            | SessionEvent::ProcessingError { session_id, .. } => session_id,
        }
    }

    pub fn to_message(&self) -> ServerMessage {
        match self.clone() {
            SessionEvent::Processing { session_id } => ServerMessage::Processing { session_id },
            SessionEvent::TranscriptDelta {
                session_id,
                seq,
                text,
                start_ms,
                end_ms,
            } => ServerMessage::TranscriptDelta {
                session_id,
                seq,
                text,
                start_ms,
                end_ms,
            },
            SessionEvent::Completed {
                session_id,
                transcript,
                summary,
                download_url,
            } => ServerMessage::Completed {
                session_id,
                transcript,
                summary,
                download_url,
            },
            SessionEvent::ProcessingError { session_id, error } => {
                ServerMessage::ProcessingError { session_id, error }
            }
        }
    }
}

/// Encode chunk payload bytes for transport inside a JSON message.
pub fn encode_payload(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode a base64 chunk payload received off the wire.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .context("invalid base64 chunk payload")
}
