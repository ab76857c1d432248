//! Dispatch gate
//!
//! Hands finished clips to the send collaborator with at most one send in
//! flight. Clips that arrive while a send is outstanding are dropped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DispatchTuning;
use crate::error::CallError;
use crate::events::{CallEvent, EventBus, FailureTracker};
use crate::recording::AudioClip;

/// Receives finished utterances
#[async_trait]
pub trait AudioSender: Send + Sync {
    async fn send_audio(&self, clip: &AudioClip) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    /// Another send was in flight; the clip was dropped
    Busy,
    Failed(CallError),
}

/// Totals for the session summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub sent: u32,
    pub failed: u32,
    pub dropped: u32,
}

struct GateInner {
    sender: Arc<dyn AudioSender>,
    in_flight: AtomicBool,
    timeout: Duration,
    events: EventBus,
    failures: FailureTracker,
    sent: AtomicU32,
    failed: AtomicU32,
    dropped: AtomicU32,
}

/// Clears the in-flight flag however the send ends, including cancellation
struct InFlightGuard {
    inner: Arc<GateInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct DispatchGate {
    inner: Arc<GateInner>,
}

impl DispatchGate {
    pub fn new(
        sender: Arc<dyn AudioSender>,
        tuning: &DispatchTuning,
        events: EventBus,
        failures: FailureTracker,
    ) -> Self {
        Self {
            inner: Arc::new(GateInner {
                sender,
                in_flight: AtomicBool::new(false),
                timeout: Duration::from_millis(tuning.timeout_ms),
                events,
                failures,
                sent: AtomicU32::new(0),
                failed: AtomicU32::new(0),
                dropped: AtomicU32::new(0),
            }),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            sent: self.inner.sent.load(Ordering::SeqCst),
            failed: self.inner.failed.load(Ordering::SeqCst),
            dropped: self.inner.dropped.load(Ordering::SeqCst),
        }
    }

    fn try_reserve(&self, clip: &AudioClip) -> Option<InFlightGuard> {
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Some(InFlightGuard {
                inner: Arc::clone(&self.inner),
            });
        }
        debug!(clip_id = %clip.id, "Dispatch already in flight, dropping clip");
        self.inner.dropped.fetch_add(1, Ordering::SeqCst);
        self.inner
            .events
            .emit(CallEvent::DispatchDropped { clip_id: clip.id });
        None
    }

    /// Send the clip unless another send is outstanding
    pub async fn send_if_not_busy(&self, clip: AudioClip) -> DispatchOutcome {
        match self.try_reserve(&clip) {
            Some(guard) => self.send_reserved(guard, clip).await,
            None => DispatchOutcome::Busy,
        }
    }

    /// Like `send_if_not_busy`, but the send runs on its own task. The gate is
    /// claimed before this returns, so a second call right after is dropped.
    pub fn spawn_send(&self, clip: AudioClip) -> Option<JoinHandle<DispatchOutcome>> {
        let guard = self.try_reserve(&clip)?;
        let gate = self.clone();
        Some(tokio::spawn(async move { gate.send_reserved(guard, clip).await }))
    }

    async fn send_reserved(&self, _guard: InFlightGuard, clip: AudioClip) -> DispatchOutcome {
        let inner = &self.inner;
        let clip_id = clip.id;
        inner.events.emit(CallEvent::DispatchStarted {
            clip_id,
            duration_ms: clip.duration_ms,
        });
        info!(
            event = "dispatch_started",
            clip_id = %clip_id,
            duration_ms = clip.duration_ms,
            bytes = clip.bytes.len(),
            "Sending utterance"
        );

        let result = match tokio::time::timeout(inner.timeout, inner.sender.send_audio(&clip)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CallError::DispatchFailure(format!("{:#}", e))),
            Err(_) => Err(CallError::DispatchTimeout(inner.timeout.as_millis() as u64)),
        };

        let outcome = match result {
            Ok(()) => {
                inner.sent.fetch_add(1, Ordering::SeqCst);
                inner.failures.record_success();
                info!(event = "dispatch_finished", clip_id = %clip_id, "Utterance sent");
                DispatchOutcome::Sent
            }
            Err(err) => {
                inner.failed.fetch_add(1, Ordering::SeqCst);
                error!(event = "dispatch_failed", clip_id = %clip_id, "{}", err);
                inner.failures.record_failure(&err);
                DispatchOutcome::Failed(err)
            }
        };

        inner.events.emit(CallEvent::DispatchFinished {
            clip_id,
            ok: outcome == DispatchOutcome::Sent,
        });
        outcome
    }
}

/// Writes each utterance to a directory as a WAV file
pub struct WavDirectorySender {
    dir: PathBuf,
}

impl WavDirectorySender {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn file_name(clip: &AudioClip) -> String {
        format!(
            "utterance-{}-{}.wav",
            clip.recorded_at.format("%Y%m%d-%H%M%S"),
            clip.id
        )
    }
}

#[async_trait]
impl AudioSender for WavDirectorySender {
    async fn send_audio(&self, clip: &AudioClip) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.dir.join(Self::file_name(clip));
        tokio::fs::write(&path, &clip.bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Saved utterance to {}", path.display());
        Ok(())
    }
}

/// Posts each utterance as a multipart upload
pub struct HttpUploadSender {
    client: reqwest::Client,
    url: String,
}

impl HttpUploadSender {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl AudioSender for HttpUploadSender {
    async fn send_audio(&self, clip: &AudioClip) -> Result<()> {
        let part = reqwest::multipart::Part::bytes(clip.bytes.clone())
            .file_name(WavDirectorySender::file_name(clip))
            .mime_str(clip.mime_type)
            .context("Invalid audio MIME type")?;
        let form = reqwest::multipart::Form::new()
            .text("id", clip.id.to_string())
            .text("duration_ms", clip.duration_ms.to_string())
            .part("audio", part);

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("Upload to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Upload rejected with {}: {}", status, body);
            anyhow::bail!("Upload rejected with status {}", status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Notice;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;
    use uuid::Uuid;

    fn clip() -> AudioClip {
        AudioClip {
            id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            mime_type: "audio/wav",
            sample_rate: 16000,
            duration_ms: 500,
            bytes: vec![1, 2, 3, 4],
        }
    }

    /// Holds every send until released
    #[derive(Default)]
    struct BlockingSender {
        calls: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl AudioSender for BlockingSender {
        async fn send_audio(&self, _clip: &AudioClip) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(())
        }
    }

    struct FailingSender;

    #[async_trait]
    impl AudioSender for FailingSender {
        async fn send_audio(&self, _clip: &AudioClip) -> Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    struct HangingSender;

    #[async_trait]
    impl AudioSender for HangingSender {
        async fn send_audio(&self, _clip: &AudioClip) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    fn gate(sender: Arc<dyn AudioSender>, timeout_ms: u64, bus: EventBus) -> DispatchGate {
        let tuning = DispatchTuning {
            timeout_ms,
            failure_notice_threshold: 3,
        };
        let failures = FailureTracker::new(tuning.failure_notice_threshold, bus.clone());
        DispatchGate::new(sender, &tuning, bus, failures)
    }

    #[tokio::test]
    async fn test_back_to_back_sends_reach_collaborator_once() {
        let sender = Arc::new(BlockingSender::default());
        let gate = gate(sender.clone(), 5_000, EventBus::new());

        let first = gate.spawn_send(clip()).expect("gate should be free");
        assert!(gate.is_busy());
        assert_eq!(gate.send_if_not_busy(clip()).await, DispatchOutcome::Busy);

        // Let the first send reach the collaborator before releasing it
        while sender.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        sender.release.notify_one();
        assert_eq!(first.await.unwrap(), DispatchOutcome::Sent);

        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);
        assert!(!gate.is_busy());
        assert_eq!(gate.stats(), DispatchStats { sent: 1, failed: 0, dropped: 1 });
    }

    #[tokio::test]
    async fn test_failure_still_releases_gate() {
        let gate = gate(Arc::new(FailingSender), 5_000, EventBus::new());
        let outcome = gate.send_if_not_busy(clip()).await;
        assert!(matches!(outcome, DispatchOutcome::Failed(CallError::DispatchFailure(_))));
        assert!(!gate.is_busy());
        assert_eq!(gate.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_hanging_send_times_out() {
        let gate = gate(Arc::new(HangingSender), 50, EventBus::new());
        let outcome = gate.send_if_not_busy(clip()).await;
        assert_eq!(outcome, DispatchOutcome::Failed(CallError::DispatchTimeout(50)));
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn test_repeated_failures_raise_notice() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let gate = gate(Arc::new(FailingSender), 5_000, bus);
        for _ in 0..3 {
            gate.send_if_not_busy(clip()).await;
        }

        let mut notices = 0;
        while let Ok(event) = rx.try_recv() {
            if let CallEvent::Notice(Notice::RepeatedFailures { count, .. }) = event {
                assert_eq!(count, 3);
                notices += 1;
            }
        }
        assert_eq!(notices, 1);
    }

    #[tokio::test]
    async fn test_events_bracket_the_send() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let sender = Arc::new(BlockingSender::default());
        sender.release.notify_one();
        let gate = gate(sender, 5_000, bus);
        let clip = clip();
        let id = clip.id;

        assert_eq!(gate.send_if_not_busy(clip).await, DispatchOutcome::Sent);
        assert_eq!(
            rx.try_recv().unwrap(),
            CallEvent::DispatchStarted { clip_id: id, duration_ms: 500 }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            CallEvent::DispatchFinished { clip_id: id, ok: true }
        );
    }

    #[tokio::test]
    async fn test_wav_directory_sender_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested");
        let sender = WavDirectorySender::new(out.clone());
        let clip = clip();

        sender.send_audio(&clip).await.unwrap();

        let path = out.join(WavDirectorySender::file_name(&clip));
        assert_eq!(std::fs::read(path).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_file_name_format() {
        let clip = clip();
        let name = WavDirectorySender::file_name(&clip);
        assert!(name.starts_with("utterance-"));
        assert!(name.ends_with(&format!("{}.wav", clip.id)));
    }
}
