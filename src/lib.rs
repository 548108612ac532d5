pub mod codec;
pub mod config;
pub mod coordinator;
pub mod export;
pub mod http;
pub mod identity;
pub mod protocol;
pub mod store;
pub mod uploader;
pub mod worker;

pub use config::Config;
pub use coordinator::{IngestError, SessionCoordinator};
pub use http::{create_router, AppState};
pub use identity::{IdentityProvider, StaticTokenIdentity};
pub use protocol::{ChunkAck, ClientMessage, ServerMessage, SessionEvent};
pub use store::{
    BlobStore, ChunkRecord, FsBlobStore, FsMetadataStore, MemoryStore, MetadataStore, Session,
    SessionStatus, StoreError,
};
pub use uploader::{
    CaptureSlice, CaptureSource, ChunkMeta, LocalTransport, SessionTransport, Uploader,
    UploaderConfig, UploaderState, WsTransport,
};
pub use worker::{StubTranscriber, Transcriber, TranscriptionWorker};
