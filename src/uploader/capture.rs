use anyhow::Result;
use tokio::sync::mpsc;

/// One time-sliced unit of captured audio, ready for upload.
#[derive(Debug, Clone)]
pub struct CaptureSlice {
    /// Encoded audio bytes for this slice.
    pub bytes: Vec<u8>,
    /// Offset of the slice start from the beginning of capture.
    pub start_time_ms: u64,
}

/// Live audio capture collaborator.
///
/// `start` hands back the channel completed slices arrive on; dropping the
/// sender ends the stream. `pause`/`resume` suspend slice production without
/// tearing the source down; `stop` releases the underlying media source.
#[async_trait::async_trait]
pub trait CaptureSource: Send + Sync {
    async fn start(&mut self) -> Result<mpsc::Receiver<CaptureSlice>>;

    async fn pause(&mut self) -> Result<()>;

    async fn resume(&mut self) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;
}
