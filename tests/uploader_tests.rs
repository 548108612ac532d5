// Uploader tests: gap-free sequencing, the bounded unacked window, retry
// behavior, and the stop drain with its stub fallback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use audioscribe::protocol::{ChunkAck, SessionEvent};
use audioscribe::uploader::{
    CaptureSlice, CaptureSource, ChunkMeta, SessionTransport, Uploader, UploaderConfig,
    UploaderState, FALLBACK_ERROR, FALLBACK_TRANSCRIPT, FINAL_TRANSCRIPT_SEPARATOR,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

/// Scriptable transport: records every transmit attempt, can reject a seq a
/// configured number of times, and can hold acks back until released.
struct FakeTransport {
    events: broadcast::Sender<SessionEvent>,
    inner: Mutex<FakeInner>,
}

#[derive(Default)]
struct FakeInner {
    /// Every send attempt as `(session_id, seq)`, in arrival order.
    sent: Vec<(String, u32)>,
    /// seq -> remaining rejections before the seq is accepted.
    reject: HashMap<u32, u32>,
    /// Remaining sends that fail outright instead of returning an ack.
    fail_sends: u32,
    hold_acks: bool,
    held: Vec<(u32, oneshot::Sender<ChunkAck>)>,
    sessions_started: u32,
    complete_on_stop: Option<String>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            inner: Mutex::new(FakeInner::default()),
        })
    }

    fn sent(&self) -> Vec<(String, u32)> {
        self.inner.lock().unwrap().sent.clone()
    }

    fn sent_seqs(&self) -> Vec<u32> {
        self.sent().into_iter().map(|(_, seq)| seq).collect()
    }

    fn reject_times(&self, seq: u32, times: u32) {
        self.inner.lock().unwrap().reject.insert(seq, times);
    }

    fn fail_sends(&self, times: u32) {
        self.inner.lock().unwrap().fail_sends = times;
    }

    fn hold_acks(&self, hold: bool) {
        self.inner.lock().unwrap().hold_acks = hold;
    }

    /// Acknowledge everything currently held.
    fn release_held(&self) {
        let held = std::mem::take(&mut self.inner.lock().unwrap().held);
        for (seq, tx) in held {
            let _ = tx.send(ChunkAck::accepted(seq));
        }
    }

    fn complete_on_stop(&self, transcript: &str) {
        self.inner.lock().unwrap().complete_on_stop = Some(transcript.to_string());
    }
}

#[async_trait]
impl SessionTransport for FakeTransport {
    async fn start_session(&self, _title: &str) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions_started += 1;
        Ok(format!("session-{}", inner.sessions_started))
    }

    async fn send_chunk(
        &self,
        meta: ChunkMeta,
        _payload: Vec<u8>,
    ) -> Result<oneshot::Receiver<ChunkAck>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        inner.sent.push((meta.session_id, meta.seq));

        if inner.fail_sends > 0 {
            inner.fail_sends -= 1;
            anyhow::bail!("injected send failure");
        }

        if let Some(remaining) = inner.reject.get_mut(&meta.seq) {
            if *remaining > 0 {
                *remaining -= 1;
                let _ = tx.send(ChunkAck::rejected(meta.seq, "injected rejection"));
                return Ok(rx);
            }
        }

        if inner.hold_acks {
            inner.held.push((meta.seq, tx));
        } else {
            let _ = tx.send(ChunkAck::accepted(meta.seq));
        }
        Ok(rx)
    }

    async fn send_stopped(&self, session_id: &str) -> Result<()> {
        let transcript = self.inner.lock().unwrap().complete_on_stop.clone();
        if let Some(transcript) = transcript {
            let _ = self.events.send(SessionEvent::Completed {
                session_id: session_id.to_string(),
                transcript,
                summary: "summary".to_string(),
                download_url: format!("/sessions/{session_id}/download"),
            });
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// Capture source driven by the test: `push` feeds a slice, `stop` closes
/// the stream.
#[derive(Clone)]
struct TestCapture {
    tx: Arc<Mutex<Option<mpsc::Sender<CaptureSlice>>>>,
}

impl TestCapture {
    fn new() -> Self {
        Self {
            tx: Arc::new(Mutex::new(None)),
        }
    }

    fn push(&self, bytes: &[u8], start_time_ms: u64) {
        let tx = self.tx.lock().unwrap().clone().expect("capture not started");
        tx.try_send(CaptureSlice {
            bytes: bytes.to_vec(),
            start_time_ms,
        })
        .expect("capture channel full");
    }
}

#[async_trait]
impl CaptureSource for TestCapture {
    async fn start(&mut self) -> Result<mpsc::Receiver<CaptureSlice>> {
        let (tx, rx) = mpsc::channel(64);
        *self.tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn pause(&mut self) -> Result<()> {
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.tx.lock().unwrap().take();
        Ok(())
    }
}

fn fast_config() -> UploaderConfig {
    UploaderConfig {
        max_unacked: 3,
        max_retries: 3,
        retry_base_delay: Duration::from_millis(5),
        drain_timeout: Duration::from_secs(2),
        drain_poll_interval: Duration::from_millis(5),
        completion_timeout: Duration::from_millis(150),
        mime_type: "audio/webm".to_string(),
    }
}

fn make_uploader(transport: Arc<FakeTransport>, config: UploaderConfig) -> (Uploader, TestCapture) {
    let capture = TestCapture::new();
    let uploader = Uploader::new(transport, Box::new(capture.clone()), config);
    (uploader, capture)
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_sequence_numbers_are_gap_free_and_ordered() -> Result<()> {
    let transport = FakeTransport::new();
    let (uploader, capture) = make_uploader(transport.clone(), fast_config());

    uploader.start("t").await?;
    assert_eq!(uploader.state(), UploaderState::Recording);
    assert_eq!(uploader.session_id().as_deref(), Some("session-1"));

    for i in 0..5u64 {
        capture.push(b"slice", i * 15_000);
    }

    wait_for("all acks", || uploader.last_ack_seq() == Some(5)).await;
    assert_eq!(transport.sent_seqs(), vec![1, 2, 3, 4, 5]);
    Ok(())
}

#[tokio::test]
async fn test_unacked_window_bounds_inflight_chunks() -> Result<()> {
    let transport = FakeTransport::new();
    let config = UploaderConfig {
        max_unacked: 2,
        ..fast_config()
    };
    let (uploader, capture) = make_uploader(transport.clone(), config);

    transport.hold_acks(true);
    uploader.start("t").await?;

    for i in 0..3u64 {
        capture.push(b"slice", i * 15_000);
    }

    // The third chunk must be withheld while two acks are outstanding.
    wait_for("window to fill", || transport.sent_seqs().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.sent_seqs(), vec![1, 2]);

    transport.hold_acks(false);
    transport.release_held();
    wait_for("held chunk to flush", || {
        transport.sent_seqs() == vec![1, 2, 3]
    })
    .await;
    wait_for("final ack", || uploader.last_ack_seq() == Some(3)).await;
    Ok(())
}

#[tokio::test]
async fn test_rejected_chunk_retries_until_accepted() -> Result<()> {
    let transport = FakeTransport::new();
    let (uploader, capture) = make_uploader(transport.clone(), fast_config());

    transport.reject_times(1, 2);
    uploader.start("t").await?;
    capture.push(b"slice", 0);

    wait_for("eventual ack", || uploader.last_ack_seq() == Some(1)).await;

    // Two rejections plus the successful attempt.
    assert_eq!(transport.sent_seqs(), vec![1, 1, 1]);
    assert!(uploader.error().is_none());
    Ok(())
}

#[tokio::test]
async fn test_failed_send_counts_as_missing_ack_and_retries() -> Result<()> {
    let transport = FakeTransport::new();
    let (uploader, capture) = make_uploader(transport.clone(), fast_config());

    transport.fail_sends(1);
    uploader.start("t").await?;
    capture.push(b"slice", 0);

    // The failed transmit surfaces as a rejection and goes through the same
    // retry path as a negative ack.
    wait_for("retried ack", || uploader.last_ack_seq() == Some(1)).await;
    assert_eq!(transport.sent_seqs(), vec![1, 1]);
    assert!(uploader.error().is_none());
    Ok(())
}

#[tokio::test]
async fn test_chunk_dropped_after_retry_ceiling() -> Result<()> {
    let transport = FakeTransport::new();
    let (uploader, capture) = make_uploader(transport.clone(), fast_config());

    transport.reject_times(1, u32::MAX);
    uploader.start("t").await?;
    capture.push(b"slice", 0);

    // Initial attempt plus max_retries, then the chunk is dropped for good.
    wait_for("retries to exhaust", || transport.sent_seqs().len() == 4).await;
    wait_for("drop to be reported", || {
        uploader
            .error()
            .is_some_and(|e| e.contains("dropped after 3 retries"))
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.sent_seqs().len(), 4);
    assert_eq!(uploader.last_ack_seq(), None);
    Ok(())
}

#[tokio::test]
async fn test_stop_waits_for_completed_event() -> Result<()> {
    let transport = FakeTransport::new();
    let (uploader, capture) = make_uploader(transport.clone(), fast_config());

    transport.complete_on_stop("the real transcript");
    uploader.start("t").await?;
    capture.push(b"slice", 0);
    wait_for("ack", || uploader.last_ack_seq() == Some(1)).await;

    uploader.stop().await?;

    assert_eq!(uploader.state(), UploaderState::Completed);
    assert!(uploader.error().is_none());

    let transcript = uploader.live_transcript();
    assert!(transcript.contains(&FINAL_TRANSCRIPT_SEPARATOR.to_string()));
    assert!(transcript.contains(&"the real transcript".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_stop_falls_back_to_stub_without_terminal_event() -> Result<()> {
    let transport = FakeTransport::new();
    let (uploader, capture) = make_uploader(transport.clone(), fast_config());

    uploader.start("t").await?;
    capture.push(b"slice", 0);
    wait_for("ack", || uploader.last_ack_seq() == Some(1)).await;

    // No completed event ever arrives; stop must still terminate with a
    // local stub result instead of hanging.
    let started = Instant::now();
    uploader.stop().await?;
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(uploader.state(), UploaderState::Completed);
    assert_eq!(uploader.error().as_deref(), Some(FALLBACK_ERROR));

    let transcript = uploader.live_transcript();
    assert_eq!(
        transcript.last().map(String::as_str),
        Some(FALLBACK_TRANSCRIPT)
    );
    assert!(transcript.contains(&FINAL_TRANSCRIPT_SEPARATOR.to_string()));
    Ok(())
}

#[tokio::test]
async fn test_retry_never_crosses_a_session_restart() -> Result<()> {
    let transport = FakeTransport::new();
    let config = UploaderConfig {
        // Long enough for a stop + restart to happen while the retry sleeps.
        retry_base_delay: Duration::from_millis(200),
        completion_timeout: Duration::from_millis(20),
        ..fast_config()
    };
    let (uploader, capture) = make_uploader(transport.clone(), config);

    transport.reject_times(1, u32::MAX);
    uploader.start("first").await?;
    capture.push(b"slice", 0);
    wait_for("first attempt", || !transport.sent_seqs().is_empty()).await;

    // Stop while the rejected chunk sits in its backoff sleep, then start a
    // fresh session.
    uploader.stop().await?;
    uploader.start("second").await?;
    capture.push(b"slice", 0);

    wait_for("new session chunk", || {
        transport
            .sent()
            .iter()
            .any(|(session, _)| session == "session-2")
    })
    .await;

    // Give the stale retry timer time to fire; its chunk must never be
    // retransmitted into either session.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let first_session_attempts = transport
        .sent()
        .iter()
        .filter(|(session, _)| session == "session-1")
        .count();
    assert_eq!(first_session_attempts, 1);
    Ok(())
}

#[tokio::test]
async fn test_stale_ack_after_restart_does_not_wedge_window() -> Result<()> {
    let transport = FakeTransport::new();
    let config = UploaderConfig {
        // Short enough for the drain to give up with the ack still held.
        drain_timeout: Duration::from_millis(50),
        completion_timeout: Duration::from_millis(20),
        ..fast_config()
    };
    let (uploader, capture) = make_uploader(transport.clone(), config);

    transport.hold_acks(true);
    uploader.start("first").await?;
    capture.push(b"slice", 0);
    wait_for("held transmit", || transport.sent_seqs().len() == 1).await;

    // The drain budget expires with the ack outstanding; stop proceeds.
    uploader.stop().await?;

    transport.hold_acks(false);
    uploader.start("second").await?;

    // The first session's ack finally lands. It must be discarded: neither
    // the window counter nor the ack watermark of the new session may move.
    transport.release_held();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(uploader.last_ack_seq(), None);

    capture.push(b"slice", 0);
    wait_for("second session transmit", || {
        transport
            .sent()
            .iter()
            .any(|(session, _)| session == "session-2")
    })
    .await;
    wait_for("second session ack", || uploader.last_ack_seq() == Some(1)).await;
    Ok(())
}

#[tokio::test]
async fn test_stop_drain_exits_as_soon_as_acks_arrive() -> Result<()> {
    let transport = FakeTransport::new();
    let config = UploaderConfig {
        drain_timeout: Duration::from_secs(10),
        ..fast_config()
    };
    let (uploader, capture) = make_uploader(transport.clone(), config);

    transport.hold_acks(true);
    uploader.start("t").await?;
    capture.push(b"slice", 0);
    capture.push(b"slice", 15_000);
    wait_for("held transmits", || transport.sent_seqs().len() == 2).await;

    // Acks arrive mid-drain; stop must return well before the ceiling.
    let release = transport.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        release.hold_acks(false);
        release.release_held();
    });

    let started = Instant::now();
    uploader.stop().await?;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(uploader.last_ack_seq(), Some(2));
    Ok(())
}

#[tokio::test]
async fn test_start_rejected_while_recording() -> Result<()> {
    let transport = FakeTransport::new();
    let (uploader, _capture) = make_uploader(transport.clone(), fast_config());

    uploader.start("t").await?;
    assert!(uploader.start("again").await.is_err());
    assert_eq!(uploader.session_id().as_deref(), Some("session-1"));
    Ok(())
}

#[tokio::test]
async fn test_pause_and_resume_toggle_state() -> Result<()> {
    let transport = FakeTransport::new();
    let (uploader, _capture) = make_uploader(transport.clone(), fast_config());

    uploader.start("t").await?;
    uploader.pause().await?;
    assert_eq!(uploader.state(), UploaderState::Paused);

    // Pause is idempotent outside the recording state.
    uploader.pause().await?;
    assert_eq!(uploader.state(), UploaderState::Paused);

    uploader.resume().await?;
    assert_eq!(uploader.state(), UploaderState::Recording);
    Ok(())
}
