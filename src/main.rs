use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

use audioscribe::{
    create_router, AppState, Config, FsBlobStore, FsMetadataStore, SessionCoordinator,
    StaticTokenIdentity, StubTranscriber, TranscriptionWorker,
};

#[derive(Parser)]
#[command(name = "audioscribe", about = "Chunked audio ingestion and transcription service")]
struct Cli {
    /// Configuration file (without extension)
    #[arg(long, default_value = "config/audioscribe")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingestion server
    Serve,
    /// Re-run the transcription worker for one session and exit
    Process { session_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    match cli.command {
        Command::Serve => serve(cfg).await,
        Command::Process { session_id } => process(cfg, &session_id).await,
    }
}

async fn serve(cfg: Config) -> Result<()> {
    let store = Arc::new(FsMetadataStore::new(&cfg.storage.data_dir)?);
    let blobs = Arc::new(FsBlobStore::new(&cfg.storage.data_dir)?);

    let (events_tx, _) = broadcast::channel(256);
    let (jobs_tx, jobs_rx) = mpsc::channel(64);

    let coordinator = Arc::new(SessionCoordinator::new(
        store.clone(),
        blobs.clone(),
        events_tx.clone(),
        jobs_tx,
    ));

    let worker = Arc::new(TranscriptionWorker::new(
        store.clone(),
        blobs,
        Arc::new(StubTranscriber),
        events_tx,
    ));
    tokio::spawn(worker.run(jobs_rx));

    let identity = Arc::new(StaticTokenIdentity::new(cfg.auth.tokens.clone()));
    let state = AppState {
        coordinator,
        store,
        identity,
    };

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    info!("{} listening on {}", cfg.service.name, addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, create_router(state)).await?;

    Ok(())
}

async fn process(cfg: Config, session_id: &str) -> Result<()> {
    let store = Arc::new(FsMetadataStore::new(&cfg.storage.data_dir)?);
    let blobs = Arc::new(FsBlobStore::new(&cfg.storage.data_dir)?);

    let (events_tx, _) = broadcast::channel(16);
    let worker = TranscriptionWorker::new(store, blobs, Arc::new(StubTranscriber), events_tx);

    if let Err(err) = worker.process_session(session_id).await {
        error!("processing failed for session {}: {:#}", session_id, err);
        std::process::exit(2);
    }

    info!("session {} processed", session_id);
    Ok(())
}
