use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

/// Durable storage for chunk payloads, addressed by `(session_id, locator)`.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist one chunk payload; returns the locator to record in metadata.
    async fn put(&self, session_id: &str, seq: u32, bytes: &[u8]) -> Result<String>;

    /// Fetch a payload by locator. `None` means the blob is gone, which the
    /// worker treats as a per-chunk sentinel, not a failure.
    async fn get(&self, session_id: &str, locator: &str) -> Result<Option<Vec<u8>>>;
}

/// Blob filename for a sequence number, zero-padded so lexical order matches
/// seq order on disk.
pub fn chunk_filename(seq: u32) -> String {
    format!("chunk-{:06}.webm", seq)
}

/// Filesystem blob store: `<root>/<session_id>/chunk-000042.webm`.
///
/// Writes go through a temp file and a rename, so a duplicate retry for the
/// same seq replaces the blob whole and can never leave a torn write behind.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create blob root {:?}", root))?;
        info!("blob store initialized at {:?}", root);
        Ok(Self { root })
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, session_id: &str, seq: u32, bytes: &[u8]) -> Result<String> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create session dir {:?}", dir))?;

        let filename = chunk_filename(seq);
        let path = dir.join(&filename);
        let tmp = dir.join(format!("{filename}.tmp"));

        fs::write(&tmp, bytes).with_context(|| format!("failed to write blob {:?}", tmp))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to finalize blob {:?}", path))?;

        Ok(filename)
    }

    async fn get(&self, session_id: &str, locator: &str) -> Result<Option<Vec<u8>>> {
        // Locators are server-generated bare filenames.
        if locator.contains('/') || locator.contains('\\') {
            anyhow::bail!("invalid blob locator: {locator}");
        }

        let path = self.session_dir(session_id).join(locator);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read blob {:?}", path)),
        }
    }
}
