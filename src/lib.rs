//! Energy-based voice activity detection and utterance capture for
//! hands-free voice calls.
//!
//! The pipeline runs capture → analyzer → VAD → recording → dispatch:
//! [`session::VoiceSession`] owns the per-tick chain and
//! [`runtime::CallRuntime`] drives it on a tokio interval, handing finished
//! clips to a [`dispatch::DispatchGate`].

pub mod analyzer;
pub mod audio;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod logging;
pub mod recording;
pub mod runtime;
pub mod session;
pub mod vad;


pub use analyzer::{AudioFrame, EnergyReading, SignalAnalyzer, SpectrumAnalyzer};
pub use config::Config;
pub use dispatch::{AudioSender, DispatchGate, DispatchOutcome, HttpUploadSender, WavDirectorySender};
pub use error::CallError;
pub use events::{CallEvent, EventBus, FailureTracker, Notice};
pub use recording::{AudioClip, RecordingController};
pub use runtime::{CallCommand, CallRuntime, CallSummary};
pub use session::{CaptureControl, VoiceSession};
