//! Async driver for a voice session
//!
//! A fixed-rate interval drives analyzer ticks, a sleep on the session's next
//! deadline wakes the loop for timers that fall between ticks, and host
//! commands arrive over an mpsc channel. Everything runs on the caller's
//! task; only dispatch sends are spawned.

use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchGate, DispatchOutcome, DispatchStats};
use crate::error::CallError;
use crate::recording::AudioClip;
use crate::session::{SessionStats, VoiceSession};

/// Commands the host sends to a running call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    SetMuted(bool),
    ToggleMute,
    Flush,
    TogglePause,
    Close,
}

/// Monotonic millisecond clock anchored at session start
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    origin: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub fn instant_at(&self, ms: u64) -> Instant {
        self.origin + Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallSummary {
    pub session: SessionStats,
    pub dispatch: DispatchStats,
}

pub struct CallRuntime {
    session: VoiceSession,
    gate: DispatchGate,
    tick: Duration,
    clock: SessionClock,
    last_send: Option<JoinHandle<DispatchOutcome>>,
}

impl CallRuntime {
    pub fn new(session: VoiceSession, gate: DispatchGate, tick_ms: u64) -> Self {
        Self {
            session,
            gate,
            tick: Duration::from_millis(tick_ms.max(1)),
            clock: SessionClock::start(),
            last_send: None,
        }
    }

    /// Run until `Close`, the command channel closing, or a fatal device error.
    pub async fn run(
        mut self,
        mut commands: UnboundedReceiver<CallCommand>,
    ) -> Result<CallSummary, CallError> {
        self.session.open(self.clock.now_ms())?;

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = self
                .session
                .next_deadline_ms()
                .map(|ms| self.clock.instant_at(ms));

            tokio::select! {
                _ = ticker.tick() => {
                    let now = self.clock.now_ms();
                    if let Some(clip) = self.session.tick(now) {
                        self.dispatch(clip);
                    }
                }
                _ = sleep_until(deadline) => {
                    let now = self.clock.now_ms();
                    if let Some(clip) = self.session.poll_timers(now) {
                        self.dispatch(clip);
                    }
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("Command channel closed");
                        break;
                    };
                    if !self.handle_command(command)? {
                        break;
                    }
                }
            }

            // Microphone lost mid-call and could not be reopened
            if let Some(err) = self.session.take_fatal_error() {
                self.finish_pending_send().await;
                return Err(err);
            }
        }

        self.session.close();
        self.finish_pending_send().await;
        Ok(self.summary())
    }

    /// Returns false when the loop should stop
    fn handle_command(&mut self, command: CallCommand) -> Result<bool, CallError> {
        let now = self.clock.now_ms();
        match command {
            CallCommand::SetMuted(muted) => self.session.set_muted(muted, now)?,
            CallCommand::ToggleMute => {
                let muted = !self.session.is_muted();
                self.session.set_muted(muted, now)?
            }
            CallCommand::Flush => {
                if let Some(clip) = self.session.flush(now) {
                    self.dispatch(clip);
                }
            }
            CallCommand::TogglePause => {
                let paused = self.session.control().toggle();
                debug!("Pause requested: {}", paused);
            }
            CallCommand::Close => return Ok(false),
        }
        Ok(true)
    }

    fn dispatch(&mut self, clip: AudioClip) {
        if let Some(handle) = self.gate.spawn_send(clip) {
            self.last_send = Some(handle);
        }
    }

    async fn finish_pending_send(&mut self) {
        if let Some(handle) = self.last_send.take() {
            if !handle.is_finished() {
                info!("Waiting for the last utterance to finish sending");
            }
            if let Err(e) = handle.await {
                warn!("Dispatch task ended abnormally: {}", e);
            }
        }
    }

    pub fn summary(&self) -> CallSummary {
        CallSummary {
            session: self.session.stats(),
            dispatch: self.gate.stats(),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dispatch::AudioSender;
    use crate::events::{CallEvent, EventBus, FailureTracker};
    use crate::session_tests::{RecordingSender, ScriptedMicrophone};
    use std::sync::Arc;
    use tokio::sync::mpsc::unbounded_channel;

    fn runtime(mic: ScriptedMicrophone, sender: Arc<dyn AudioSender>) -> (CallRuntime, EventBus) {
        let config = Config::default();
        let events = EventBus::new();
        let failures = FailureTracker::new(3, events.clone());
        let session = VoiceSession::new(config.clone(), Box::new(mic), events.clone(), failures.clone());
        let gate = DispatchGate::new(sender, &config.dispatch, events.clone(), failures);
        (CallRuntime::new(session, gate, 10), events)
    }

    #[tokio::test]
    async fn test_flush_then_close_sends_one_clip() {
        let mic = ScriptedMicrophone::new(16000, 160);
        let sender = Arc::new(RecordingSender::default());
        let (runtime, _events) = runtime(mic, sender.clone());
        let (tx, rx) = unbounded_channel();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(CallCommand::Flush).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(CallCommand::Close).unwrap();
        });

        let summary = runtime.run(rx).await.unwrap();
        handle.await.unwrap();

        assert_eq!(summary.session.utterances, 1);
        assert_eq!(summary.dispatch.sent, 1);
        assert_eq!(sender.clips().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_device_fails_run() {
        let mic = ScriptedMicrophone::unavailable();
        let (runtime, _events) = runtime(mic, Arc::new(RecordingSender::default()));
        let (_tx, rx) = unbounded_channel();

        let err = runtime.run(rx).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_device_lost_mid_call_ends_run() {
        let mic = ScriptedMicrophone::new(16000, 160);
        let (runtime, _events) = runtime(mic.clone(), Arc::new(RecordingSender::default()));
        let (_tx, rx) = unbounded_channel();

        let unplug = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            mic.deny_grants();
            mic.fail_current_stream();
            mic
        });

        let err = runtime.run(rx).await.unwrap_err();
        assert!(err.is_fatal());
        let mic = unplug.await.unwrap();
        assert_eq!(mic.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_dropped_channel_closes_session() {
        let mic = ScriptedMicrophone::new(16000, 160);
        let (runtime, events) = runtime(mic.clone(), Arc::new(RecordingSender::default()));
        let mut rx_events = events.subscribe();
        let (tx, rx) = unbounded_channel();
        tx.send(CallCommand::ToggleMute).unwrap();
        drop(tx);

        runtime.run(rx).await.unwrap();

        assert_eq!(mic.open_streams(), 0);
        let mut saw_closed = false;
        while let Ok(event) = rx_events.try_recv() {
            saw_closed |= event == CallEvent::Closed;
        }
        assert!(saw_closed);
    }
}
