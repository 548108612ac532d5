use crate::store::{ChunkRecord, Session};

/// Synthetic subtitle interval length used when real chunk timestamps are
/// unavailable. Matches the default capture time slice.
pub const DEFAULT_SRT_CHUNK_SECS: u64 = 15;

fn chunk_text(chunk: &ChunkRecord) -> String {
    chunk
        .text
        .clone()
        .unwrap_or_else(|| format!("[chunk {}]", chunk.seq))
}

/// Plain-text export: a session header followed by one block per chunk in
/// seq order, with placeholders for chunks that never got text.
pub fn make_txt(session: &Session, chunks: &[ChunkRecord]) -> String {
    let blocks: Vec<String> = chunks
        .iter()
        .map(|c| format!("-- CHUNK {} --\n{}\n", c.seq, chunk_text(c)))
        .collect();

    format!(
        "Session: {}\nSession ID: {}\n\n{}",
        session.title,
        session.id,
        blocks.join("\n")
    )
}

/// SubRip export. Chunk timestamps are not recorded, so cues get synthetic
/// fixed-length intervals (`chunk_len_secs` per chunk). Timing is
/// approximate by design; this is a documented limitation.
pub fn make_srt(chunks: &[ChunkRecord], chunk_len_secs: u64) -> String {
    let cues: Vec<String> = chunks
        .iter()
        .enumerate()
        .map(|(idx, c)| {
            let start = idx as u64 * chunk_len_secs;
            let end = start + chunk_len_secs;
            format!(
                "{}\n{} --> {}\n{}\n",
                idx + 1,
                srt_timestamp(start),
                srt_timestamp(end),
                chunk_text(c)
            )
        })
        .collect();

    cues.join("\n")
}

fn srt_timestamp(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{secs:02},000")
}
