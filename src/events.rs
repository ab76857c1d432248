//! Typed notifications from the voice session to its host.
//!
//! Every subscriber gets every event in emission order. Emission never
//! blocks and dropped subscribers are pruned on the next emit.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::warn;
use uuid::Uuid;

use crate::error::CallError;

/// Conditions the host should show to the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    MicrophoneUnavailable { message: String },
    RepeatedFailures { count: u32, last_error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    CaptureStarted,
    CaptureStopped,
    MuteChanged { muted: bool },
    PauseChanged { paused: bool },
    /// Throttled meter update
    Levels {
        rms: f32,
        noise_floor: f32,
        bins: Vec<f32>,
    },
    Calibrated { ambient_noise: f32 },
    SpeechStarted,
    SpeechEnded { speaking_ms: u64 },
    DispatchStarted { clip_id: Uuid, duration_ms: u64 },
    DispatchFinished { clip_id: Uuid, ok: bool },
    /// A clip was ready while another send was still in flight
    DispatchDropped { clip_id: Uuid },
    Notice(Notice),
    Closed,
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<UnboundedSender<CallEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<CallEvent> {
        let (tx, rx) = unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    pub fn emit(&self, event: CallEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Counts consecutive recording/dispatch failures and tells the host once
/// the streak reaches the threshold
#[derive(Clone)]
pub struct FailureTracker {
    consecutive: Arc<AtomicU32>,
    threshold: u32,
    events: EventBus,
}

impl FailureTracker {
    pub fn new(threshold: u32, events: EventBus) -> Self {
        Self {
            consecutive: Arc::new(AtomicU32::new(0)),
            threshold: threshold.max(1),
            events,
        }
    }

    pub fn record_failure(&self, error: &CallError) {
        let count = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if count == self.threshold {
            warn!(event = "repeated_failures", count, "Repeated failures: {}", error);
            self.events.emit(CallEvent::Notice(Notice::RepeatedFailures {
                count,
                last_error: error.to_string(),
            }));
        }
    }

    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_arrive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(CallEvent::SpeechStarted);
        bus.emit(CallEvent::SpeechEnded { speaking_ms: 900 });

        assert_eq!(rx.try_recv().unwrap(), CallEvent::SpeechStarted);
        assert_eq!(rx.try_recv().unwrap(), CallEvent::SpeechEnded { speaking_ms: 900 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(CallEvent::MuteChanged { muted: true });
        assert_eq!(a.try_recv().unwrap(), CallEvent::MuteChanged { muted: true });
        assert_eq!(b.try_recv().unwrap(), CallEvent::MuteChanged { muted: true });
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let _keep = bus.subscribe();
        drop(rx);
        bus.emit(CallEvent::Closed);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_notice_serialization() {
        let event = CallEvent::Notice(Notice::MicrophoneUnavailable {
            message: "denied".to_string(),
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"notice\""));
        assert!(json.contains("\"kind\":\"microphone_unavailable\""));
    }

    #[test]
    fn test_failure_notice_fires_once_at_threshold() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let tracker = FailureTracker::new(3, bus);
        let err = CallError::DispatchFailure("503".to_string());

        tracker.record_failure(&err);
        tracker.record_failure(&err);
        assert!(rx.try_recv().is_err());
        tracker.record_failure(&err);
        assert_eq!(
            rx.try_recv().unwrap(),
            CallEvent::Notice(Notice::RepeatedFailures {
                count: 3,
                last_error: "Audio dispatch failed: 503".to_string(),
            })
        );
        tracker.record_failure(&err);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_success_resets_streak() {
        let tracker = FailureTracker::new(3, EventBus::new());
        tracker.record_failure(&CallError::DispatchTimeout(10));
        tracker.record_success();
        assert_eq!(tracker.consecutive(), 0);
    }
}
