use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::state::AppState;
use crate::export;
use crate::store::StoreError;

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    /// `txt` (default) or `srt`.
    pub format: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /sessions/:session_id/download?format=txt|srt
/// Export a session's transcript as plain text or subtitles.
pub async fn download_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> impl IntoResponse {
    let session = match state.store.session(&session_id).await {
        Ok(session) => session,
        Err(StoreError::SessionNotFound(_)) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("session {session_id} not found"),
                }),
            )
                .into_response();
        }
        Err(err) => {
            error!("failed to load session {}: {}", session_id, err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: err.to_string(),
                }),
            )
                .into_response();
        }
    };

    let chunks = match state.store.chunks_ordered(&session_id).await {
        Ok(chunks) => chunks,
        Err(err) => {
            error!("failed to load chunks for {}: {}", session_id, err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: err.to_string(),
                }),
            )
                .into_response();
        }
    };

    match query.format.as_deref() {
        Some("srt") => {
            let body = export::make_srt(&chunks, export::DEFAULT_SRT_CHUNK_SECS);
            (
                [
                    (
                        header::CONTENT_TYPE,
                        "application/x-subrip; charset=utf-8".to_string(),
                    ),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"session-{session_id}.srt\""),
                    ),
                ],
                body,
            )
                .into_response()
        }
        _ => {
            let body = export::make_txt(&session, &chunks);
            (
                [
                    (
                        header::CONTENT_TYPE,
                        "text/plain; charset=utf-8".to_string(),
                    ),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"session-{session_id}.txt\""),
                    ),
                ],
                body,
            )
                .into_response()
        }
    }
}
