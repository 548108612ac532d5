mod capture;
mod transport;
mod ws;

pub use capture::{CaptureSlice, CaptureSource};
pub use transport::{ChunkMeta, LocalTransport, SessionTransport};
pub use ws::WsTransport;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::protocol::{ChunkAck, SessionEvent};

/// Separator inserted into the live transcript ahead of a final result.
pub const FINAL_TRANSCRIPT_SEPARATOR: &str = "\n--- FINAL TRANSCRIPT ---\n";

/// Stub shown when the server never delivers a terminal event in time.
pub const FALLBACK_TRANSCRIPT: &str = "Stub transcript (no server response).";
pub const FALLBACK_ERROR: &str = "Server did not respond quickly; showing stub result.";

/// Uploader lifecycle: `idle → starting → recording ⇄ paused → processing →
/// {completed | error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploaderState {
    Idle,
    Starting,
    Recording,
    Paused,
    Processing,
    Completed,
    Error,
}

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Backpressure window: chunks allowed in flight without an ack.
    pub max_unacked: usize,
    /// Per-chunk retry ceiling before the chunk is dropped.
    pub max_retries: u32,
    /// Base of the exponential retry backoff (`base × 2^(retries-1)`).
    pub retry_base_delay: Duration,
    /// Ceiling on waiting for the pending queue to drain during `stop`.
    pub drain_timeout: Duration,
    /// Poll period for the drain wait. Polled, not event-driven, so the stop
    /// tail latency stays predictable.
    pub drain_poll_interval: Duration,
    /// How long `stop` waits for the server's terminal `completed` event
    /// before synthesizing a local stub result.
    pub completion_timeout: Duration,
    /// Encoding label attached to every chunk.
    pub mime_type: String,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_unacked: 3,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
            drain_timeout: Duration::from_secs(20),
            drain_poll_interval: Duration::from_millis(200),
            completion_timeout: Duration::from_secs(8),
            mime_type: crate::codec::FALLBACK_MIME.to_string(),
        }
    }
}

/// An enqueued chunk awaiting transmission or retry. Carries the session id
/// and epoch captured at enqueue time; a retry is admitted back into the
/// queue only while both still match, so a mid-flight session change can
/// never leak chunks across sessions.
#[derive(Debug, Clone)]
struct PendingChunk {
    seq: u32,
    bytes: Vec<u8>,
    start_time_ms: u64,
    retries: u32,
    session_id: String,
    session_epoch: u64,
}

/// Client-side flow-controlled uploader.
///
/// Turns a live capture stream into a gap-free, seq-numbered chunk sequence
/// delivered to one session, bounding unacknowledged work to the configured
/// window and retrying rejected chunks with exponential backoff.
pub struct Uploader {
    inner: Arc<UploaderInner>,
    capture: Mutex<Box<dyn CaptureSource>>,
    capture_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    events_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct UploaderInner {
    config: UploaderConfig,
    transport: Arc<dyn SessionTransport>,
    state: std::sync::Mutex<UploaderState>,
    queue: Mutex<VecDeque<PendingChunk>>,
    unacked: AtomicUsize,
    next_seq: AtomicU32,
    /// Bumped on every `start`; pending items remember the epoch they were
    /// enqueued under.
    epoch: AtomicU64,
    session_id: std::sync::Mutex<Option<String>>,
    last_ack_seq: AtomicU32,
    error: std::sync::Mutex<Option<String>>,
    live_transcript: std::sync::Mutex<Vec<String>>,
    /// Re-entrancy guard: one drain pass at a time.
    flushing: AtomicBool,
}

impl Uploader {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        capture: Box<dyn CaptureSource>,
        config: UploaderConfig,
    ) -> Self {
        Self {
            inner: Arc::new(UploaderInner {
                config,
                transport,
                state: std::sync::Mutex::new(UploaderState::Idle),
                queue: Mutex::new(VecDeque::new()),
                unacked: AtomicUsize::new(0),
                next_seq: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
                session_id: std::sync::Mutex::new(None),
                last_ack_seq: AtomicU32::new(0),
                error: std::sync::Mutex::new(None),
                live_transcript: std::sync::Mutex::new(Vec::new()),
                flushing: AtomicBool::new(false),
            }),
            capture: Mutex::new(capture),
            capture_task: std::sync::Mutex::new(None),
            events_task: std::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> UploaderState {
        *self.inner.state.lock().unwrap()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().unwrap().clone()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.error.lock().unwrap().clone()
    }

    /// Highest sequence number the server has confirmed, if any.
    pub fn last_ack_seq(&self) -> Option<u32> {
        match self.inner.last_ack_seq.load(Ordering::SeqCst) {
            0 => None,
            seq => Some(seq),
        }
    }

    pub fn live_transcript(&self) -> Vec<String> {
        self.inner.live_transcript.lock().unwrap().clone()
    }

    /// Request a new session and begin capturing into it.
    ///
    /// Resets the sequence counter, clears any stale pending queue and bumps
    /// the session epoch before the protocol round-trip, so chunks from a
    /// previous session can never be delivered into the new one.
    pub async fn start(&self, title: &str) -> Result<()> {
        {
            let state = self.state();
            if matches!(
                state,
                UploaderState::Starting
                    | UploaderState::Recording
                    | UploaderState::Paused
                    | UploaderState::Processing
            ) {
                anyhow::bail!("recording already in progress");
            }
        }

        self.inner.set_state(UploaderState::Starting);
        self.inner.set_error(None);

        {
            // Epoch bump, queue clear and counter resets happen under the
            // queue lock so a concurrently scheduled retry or straggling ack
            // cannot observe one without the others.
            let mut queue = self.inner.queue.lock().await;
            queue.clear();
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            self.inner.next_seq.store(0, Ordering::SeqCst);
            self.inner.unacked.store(0, Ordering::SeqCst);
            self.inner.last_ack_seq.store(0, Ordering::SeqCst);
        }
        self.inner.live_transcript.lock().unwrap().clear();

        let session_id = match self.inner.transport.start_session(title).await {
            Ok(id) => id,
            Err(err) => {
                self.inner.set_error(Some(format!("{err:#}")));
                self.inner.set_state(UploaderState::Error);
                return Err(err);
            }
        };
        *self.inner.session_id.lock().unwrap() = Some(session_id.clone());
        info!("uploading to session {}", session_id);

        self.spawn_event_listener();

        let slices = {
            let mut capture = self.capture.lock().await;
            match capture.start().await {
                Ok(rx) => rx,
                Err(err) => {
                    self.inner.set_error(Some(format!("{err:#}")));
                    self.inner.set_state(UploaderState::Error);
                    return Err(err);
                }
            }
        };

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let mut slices = slices;
            while let Some(slice) = slices.recv().await {
                inner.enqueue(slice).await;
            }
        });
        if let Some(old) = self.capture_task.lock().unwrap().replace(task) {
            old.abort();
        }

        self.inner.set_state(UploaderState::Recording);
        Ok(())
    }

    /// Suspend capture only; the transmit loop and queue are unaffected.
    pub async fn pause(&self) -> Result<()> {
        if self.state() != UploaderState::Recording {
            return Ok(());
        }
        self.capture.lock().await.pause().await?;
        self.inner.set_state(UploaderState::Paused);
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        if self.state() != UploaderState::Paused {
            return Ok(());
        }
        self.capture.lock().await.resume().await?;
        self.inner.set_state(UploaderState::Recording);
        Ok(())
    }

    /// Stop capture, drain pending work (bounded), signal end-of-session and
    /// wait for the terminal `completed` event — falling back to a local
    /// stub result if the server's background stage outruns the wait.
    pub async fn stop(&self) -> Result<()> {
        self.inner.set_state(UploaderState::Processing);

        if let Err(err) = self.capture.lock().await.stop().await {
            warn!("capture stop failed: {:#}", err);
        }
        if let Some(task) = self.capture_task.lock().unwrap().take() {
            // The slice channel closes with the capture source; reap the
            // forwarding task so every buffered slice is enqueued.
            let _ = task.await;
        }

        let deadline = Instant::now() + self.inner.config.drain_timeout;
        loop {
            let pending = self.inner.queue.lock().await.len();
            let unacked = self.inner.unacked.load(Ordering::SeqCst);
            if pending == 0 && unacked == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "drain budget exhausted with pending={} unacked={}",
                    pending, unacked
                );
                break;
            }
            tokio::time::sleep(self.inner.config.drain_poll_interval).await;
        }

        let session_id = self
            .session_id()
            .ok_or_else(|| anyhow::anyhow!("no active session"))?;

        if let Err(err) = self.inner.transport.send_stopped(&session_id).await {
            warn!("recording-stopped failed: {:#}", err);
            self.inner.set_error(Some(format!("{err:#}")));
        }

        // The event listener owns folding the terminal transcript into the
        // live view and flipping the state; wait on that rather than racing
        // it with a second subscription.
        let completion_deadline = Instant::now() + self.inner.config.completion_timeout;
        let completed = loop {
            if self.state() == UploaderState::Completed {
                break true;
            }
            if Instant::now() >= completion_deadline {
                break false;
            }
            tokio::time::sleep(self.inner.config.drain_poll_interval).await;
        };

        if !completed {
            let mut transcript = self.inner.live_transcript.lock().unwrap();
            transcript.push(FINAL_TRANSCRIPT_SEPARATOR.to_string());
            transcript.push(FALLBACK_TRANSCRIPT.to_string());
            drop(transcript);
            self.inner.set_state(UploaderState::Completed);
            self.inner.set_error(Some(FALLBACK_ERROR.to_string()));
            warn!("no terminal event for session {}; using stub", session_id);
        }

        Ok(())
    }

    /// Tear down without flushing: stop capture, release the media source
    /// and cancel background tasks. Pending uploads are abandoned.
    pub async fn shutdown(&self) {
        if let Err(err) = self.capture.lock().await.stop().await {
            warn!("capture stop failed during shutdown: {:#}", err);
        }
        if let Some(task) = self.capture_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.events_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn spawn_event_listener(&self) {
        let inner = Arc::clone(&self.inner);
        let mut events = inner.transport.events();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => inner.on_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("event stream lagged; skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        if let Some(old) = self.events_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        if let Some(task) = self.capture_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.events_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl UploaderInner {
    fn set_state(&self, state: UploaderState) {
        *self.state.lock().unwrap() = state;
    }

    fn set_error(&self, error: Option<String>) {
        *self.error.lock().unwrap() = error;
    }

    /// Assign the next gap-free sequence number and queue the slice for
    /// transmission. The owning session is captured here, not read again at
    /// send or retry time.
    async fn enqueue(self: &Arc<Self>, slice: CaptureSlice) {
        let Some(session_id) = self.session_id.lock().unwrap().clone() else {
            warn!("capture slice arrived with no active session; dropping");
            return;
        };

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let item = PendingChunk {
            seq,
            bytes: slice.bytes,
            start_time_ms: slice.start_time_ms,
            retries: 0,
            session_id,
            session_epoch: self.epoch.load(Ordering::SeqCst),
        };

        self.queue.lock().await.push_back(item);
        self.trigger_flush();
    }

    fn trigger_flush(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.flush().await });
    }

    /// Drain the pending queue while the backpressure window has room. Only
    /// one drain pass runs at a time; acks and enqueues re-trigger it, so
    /// window utilization self-corrects.
    async fn flush(self: Arc<Self>) {
        if self.flushing.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let item = {
                let mut queue = self.queue.lock().await;
                if self.unacked.load(Ordering::SeqCst) >= self.config.max_unacked {
                    None
                } else {
                    queue.pop_front()
                }
            };

            match item {
                Some(item) => self.transmit(item).await,
                None => {
                    self.flushing.store(false, Ordering::SeqCst);
                    // An enqueue or ack may have raced the guard release.
                    let rearm = {
                        let queue = self.queue.lock().await;
                        !queue.is_empty()
                            && self.unacked.load(Ordering::SeqCst) < self.config.max_unacked
                    };
                    if rearm && !self.flushing.swap(true, Ordering::SeqCst) {
                        continue;
                    }
                    break;
                }
            }
        }
    }

    async fn transmit(self: &Arc<Self>, item: PendingChunk) {
        self.unacked.fetch_add(1, Ordering::SeqCst);

        let meta = ChunkMeta {
            session_id: item.session_id.clone(),
            seq: item.seq,
            mime_type: self.config.mime_type.clone(),
            start_time_ms: item.start_time_ms,
        };

        match self.transport.send_chunk(meta, item.bytes.clone()).await {
            Ok(ack_rx) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let ack = ack_rx
                        .await
                        .unwrap_or_else(|_| ChunkAck::rejected(item.seq, "ack channel closed"));
                    inner.on_ack(item, ack).await;
                });
            }
            Err(err) => {
                // A failed send counts as a missing acknowledgement.
                let inner = Arc::clone(self);
                let seq = item.seq;
                let message = format!("send failed: {err:#}");
                tokio::spawn(async move {
                    inner.on_ack(item, ChunkAck::rejected(seq, message)).await;
                });
            }
        }
    }

    async fn on_ack(self: Arc<Self>, mut item: PendingChunk, ack: ChunkAck) {
        {
            // Checked under the queue lock, same as requeue: an ack
            // straggling in from a previous session must not touch the new
            // session's window accounting or ack watermark.
            let _queue = self.queue.lock().await;
            if item.session_epoch != self.epoch.load(Ordering::SeqCst) {
                warn!("discarding stale ack for seq={} from a previous session", item.seq);
                return;
            }
            // The window slot frees whatever the outcome.
            self.unacked.fetch_sub(1, Ordering::SeqCst);
        }

        if ack.ok {
            self.last_ack_seq.fetch_max(item.seq, Ordering::SeqCst);
            self.set_error(None);
            self.trigger_flush();
            return;
        }

        let reason = ack
            .error
            .unwrap_or_else(|| "unknown server ack error".to_string());
        warn!("chunk seq={} rejected: {}", item.seq, reason);
        self.set_error(Some(reason));

        item.retries += 1;
        if item.retries <= self.config.max_retries {
            let delay = self.config.retry_base_delay * 2u32.pow(item.retries - 1);
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.requeue(item).await;
            });
        } else {
            error!(
                "chunk seq={} dropped after {} retries",
                item.seq, self.config.max_retries
            );
            self.set_error(Some(format!(
                "chunk seq={} dropped after {} retries",
                item.seq, self.config.max_retries
            )));
        }

        self.trigger_flush();
    }

    /// Retries requeue at the front so delivery order degrades as little as
    /// possible. The epoch comparison happens under the queue lock, so a
    /// concurrent `start` cannot slip a stale chunk into the new session.
    async fn requeue(self: Arc<Self>, item: PendingChunk) {
        {
            let mut queue = self.queue.lock().await;
            if item.session_epoch != self.epoch.load(Ordering::SeqCst) {
                warn!("not requeuing seq={} because session changed", item.seq);
                return;
            }
            queue.push_front(item);
        }
        self.trigger_flush();
    }

    fn on_event(&self, event: SessionEvent) {
        let current = self.session_id.lock().unwrap().clone();
        if current.as_deref() != Some(event.session_id()) {
            return;
        }

        match event {
            SessionEvent::Processing { .. } => {
                let mut state = self.state.lock().unwrap();
                if !matches!(*state, UploaderState::Completed | UploaderState::Error) {
                    *state = UploaderState::Processing;
                }
            }
            SessionEvent::TranscriptDelta { text, .. } => {
                self.live_transcript.lock().unwrap().push(text);
            }
            SessionEvent::Completed { transcript, .. } => {
                let mut live = self.live_transcript.lock().unwrap();
                live.push(FINAL_TRANSCRIPT_SEPARATOR.to_string());
                live.push(transcript);
                drop(live);
                self.set_state(UploaderState::Completed);
                self.set_error(None);
            }
            SessionEvent::ProcessingError { error, .. } => {
                self.set_error(Some(error));
            }
        }
    }
}
