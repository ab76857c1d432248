//! Voice call session
//!
//! Ties the capture source, analyzer, VAD machine and recording controller
//! together. The session is driven from outside: the caller invokes `tick`
//! at a fixed rate and `poll_timers` whenever a deadline passes, passing the
//! current time on a monotonic millisecond clock. Finished utterances are
//! returned to the caller, which hands them to the dispatch gate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::analyzer::{AudioFrame, SignalAnalyzer, SpectrumAnalyzer};
use crate::audio::capture::{CaptureSource, MicrophoneProvider};
use crate::config::Config;
use crate::error::CallError;
use crate::events::{CallEvent, EventBus, FailureTracker, Notice};
use crate::recording::{AudioClip, RecordingController};
use crate::vad::{VadEvent, VadMachine, VadPhase};

/// Handle for collaborators (audio playback) that need to pause analysis
/// while they are audible. Cloning shares the same switch.
#[derive(Debug, Clone, Default)]
pub struct CaptureControl {
    paused: Arc<AtomicBool>,
}

impl CaptureControl {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn toggle(&self) -> bool {
        !self.paused.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub utterances: u32,
    pub spurious_triggers: u32,
    pub speech_ms: u64,
}

pub struct VoiceSession {
    config: Config,
    capture: CaptureSource,
    analyzer: SignalAnalyzer,
    spectrum: SpectrumAnalyzer,
    vad: VadMachine,
    recording: RecordingController,
    events: EventBus,
    failures: FailureTracker,
    control: CaptureControl,
    open: bool,
    muted: bool,
    paused: bool,
    calibration_due_ms: Option<u64>,
    fatal: Option<CallError>,
    /// Samples drained this tick
    scratch: Vec<f32>,
    /// Most recent `frame_size` samples
    window: Vec<f32>,
    stats: SessionStats,
}

impl VoiceSession {
    pub fn new(
        config: Config,
        provider: Box<dyn MicrophoneProvider>,
        events: EventBus,
        failures: FailureTracker,
    ) -> Self {
        let frame_size = config.analyzer.frame_size.max(1);
        Self {
            capture: CaptureSource::new(provider),
            analyzer: SignalAnalyzer::new(config.analyzer.clone()),
            spectrum: SpectrumAnalyzer::new(frame_size, config.analyzer.spectrum_bins),
            vad: VadMachine::new(config.vad.clone()),
            recording: RecordingController::new(config.recording.clone()),
            events,
            failures,
            control: CaptureControl::default(),
            open: false,
            muted: config.start_muted,
            paused: false,
            calibration_due_ms: None,
            fatal: None,
            scratch: Vec::new(),
            window: Vec::with_capacity(frame_size),
            stats: SessionStats::default(),
            config,
        }
    }

    /// Open the microphone (unless starting muted) and begin calibrating.
    /// `DeviceUnavailable` is reported to the host and closes the session.
    pub fn open(&mut self, now_ms: u64) -> Result<(), CallError> {
        self.open = true;
        if self.muted {
            info!(event = "session_opened", muted = true, "Voice session opened muted");
            self.events.emit(CallEvent::MuteChanged { muted: true });
            return Ok(());
        }
        self.start_capture(now_ms, 0)?;
        info!(event = "session_opened", muted = false, "Voice session opened");
        Ok(())
    }

    fn start_capture(&mut self, now_ms: u64, settle_ms: u64) -> Result<(), CallError> {
        if let Err(err) = self.capture.start() {
            self.fail_device(err.clone());
            return Err(err);
        }
        self.events.emit(CallEvent::CaptureStarted);
        self.vad.reset();
        self.window.clear();
        self.calibration_due_ms = Some(now_ms + settle_ms);
        if self.config.eager_recording {
            self.start_recording(now_ms);
        }
        Ok(())
    }

    /// Report a lost microphone to the host and close the session
    fn fail_device(&mut self, err: CallError) {
        error!(event = "device_unavailable", "{}", err);
        self.events.emit(CallEvent::Notice(Notice::MicrophoneUnavailable {
            message: err.to_string(),
        }));
        self.close();
        self.fatal = Some(err);
    }

    /// A failed cpal stream never recovers, so a dead stream is swapped for a
    /// fresh grant. Returns false when the device is gone for good.
    fn ensure_healthy_capture(&mut self) -> bool {
        if !self.capture.is_active() || self.capture.is_healthy() {
            return true;
        }
        warn!(event = "capture_regrant", "Input stream failed, reopening microphone");
        self.capture.stop();
        self.events.emit(CallEvent::CaptureStopped);
        if let Err(err) = self.capture.start() {
            self.fail_device(err);
            return false;
        }
        self.events.emit(CallEvent::CaptureStarted);
        true
    }

    fn start_recording(&mut self, now_ms: u64) {
        if !self.ensure_healthy_capture() {
            return;
        }
        match self.recording.start_if_needed(&self.capture, now_ms) {
            Ok(_) => {}
            Err(err) => {
                warn!(event = "recording_start_failed", "{}", err);
                self.failures.record_failure(&err);
            }
        }
    }

    /// Device error that closed the session since the last call, if any
    pub fn take_fatal_error(&mut self) -> Option<CallError> {
        self.fatal.take()
    }

    /// One analyzer/VAD step. Returns a clip when a dispatch came due.
    pub fn tick(&mut self, now_ms: u64) -> Option<AudioClip> {
        if !self.open || self.muted {
            return None;
        }
        self.sync_pause(now_ms);
        if !self.ensure_healthy_capture() {
            return None;
        }

        self.scratch.clear();
        self.capture.drain_into(&mut self.scratch);
        if self.paused {
            return None;
        }

        let frame_size = self.config.analyzer.frame_size.max(1);
        self.window.extend_from_slice(&self.scratch);
        if self.window.len() > frame_size {
            let excess = self.window.len() - frame_size;
            self.window.drain(..excess);
        }

        self.start_due_calibration(now_ms);

        let mut clip = None;
        let was_calibrating = self.analyzer.is_calibrating();
        let reading = self.analyzer.process(AudioFrame {
            samples: &self.window,
            captured_at_ms: now_ms,
        });

        if let Some(reading) = reading {
            if was_calibrating && !self.analyzer.is_calibrating() {
                if let Some(ambient_noise) = self.analyzer.ambient_noise() {
                    self.events.emit(CallEvent::Calibrated { ambient_noise });
                }
            }
            if reading.published {
                let bins = self.spectrum.magnitudes(&self.window);
                self.events.emit(CallEvent::Levels {
                    rms: reading.rms,
                    noise_floor: reading.noise_floor,
                    bins,
                });
            }
            let events = self.vad.on_tick(reading.rms, reading.noise_floor, now_ms);
            clip = self.handle_vad_events(events, now_ms);
        }

        // After the VAD so a recording opened at speech onset keeps the onset frame
        let scratch = std::mem::take(&mut self.scratch);
        self.recording.append(&scratch);
        self.scratch = scratch;

        clip.or_else(|| self.poll_timers(now_ms))
    }

    /// Run expired silence / dispatch timers
    pub fn poll_timers(&mut self, now_ms: u64) -> Option<AudioClip> {
        if !self.open || self.muted || self.paused {
            return None;
        }
        self.start_due_calibration(now_ms);
        let events = self.vad.poll_timers(now_ms, self.recording.started_at_ms());
        self.handle_vad_events(events, now_ms)
    }

    fn start_due_calibration(&mut self, now_ms: u64) {
        if let Some(due) = self.calibration_due_ms {
            if now_ms >= due {
                self.calibration_due_ms = None;
                self.analyzer.start_calibration(now_ms);
            }
        }
    }

    fn handle_vad_events(&mut self, events: Vec<VadEvent>, now_ms: u64) -> Option<AudioClip> {
        let mut clip = None;
        for event in events {
            match event {
                VadEvent::SpeechStarted { .. } => {
                    self.events.emit(CallEvent::SpeechStarted);
                    self.start_recording(now_ms);
                }
                VadEvent::SpeechResumed { at_ms } => debug!("Speech resumed at {}ms", at_ms),
                VadEvent::SilencePending { timer_ms, .. } => {
                    debug!("Silence timer armed for {}ms", timer_ms)
                }
                VadEvent::SpuriousTrigger { .. } => self.stats.spurious_triggers += 1,
                VadEvent::SessionFinalized { speaking_ms, .. } => {
                    self.stats.speech_ms += speaking_ms;
                    self.events.emit(CallEvent::SpeechEnded { speaking_ms });
                }
                VadEvent::DispatchCancelled => {}
                VadEvent::DispatchDue => {
                    clip = self.finalize_recording();
                    if self.config.eager_recording {
                        self.start_recording(now_ms);
                    }
                }
            }
        }
        clip
    }

    fn finalize_recording(&mut self) -> Option<AudioClip> {
        match self.recording.stop_and_finalize(&[]) {
            Ok(Some(clip)) => {
                self.stats.utterances += 1;
                Some(clip)
            }
            Ok(None) => None,
            Err(err) => {
                error!(event = "finalize_failed", "{}", err);
                self.failures.record_failure(&err);
                None
            }
        }
    }

    /// Explicit user flush: finalize now regardless of timers and gates
    pub fn flush(&mut self, now_ms: u64) -> Option<AudioClip> {
        if !self.open || self.muted {
            return None;
        }
        self.sync_pause(now_ms);
        if self.paused {
            debug!("Flush ignored while paused");
            return None;
        }
        self.scratch.clear();
        self.capture.drain_into(&mut self.scratch);
        let scratch = std::mem::take(&mut self.scratch);
        self.recording.append(&scratch);
        self.scratch = scratch;

        info!(event = "flush_requested", "Explicit flush");
        let events = self.vad.force_finalize(now_ms, self.recording.started_at_ms());
        self.handle_vad_events(events, now_ms)
    }

    /// Mute tears everything down; unmute reopens the microphone from a clean
    /// idle state and recalibrates after the settle delay.
    pub fn set_muted(&mut self, muted: bool, now_ms: u64) -> Result<(), CallError> {
        if muted == self.muted || !self.open {
            self.muted = muted;
            return Ok(());
        }
        self.muted = muted;
        self.events.emit(CallEvent::MuteChanged { muted });

        if muted {
            info!(event = "muted", "Microphone muted");
            self.halt_analysis();
            if self.capture.is_active() {
                self.capture.stop();
                self.events.emit(CallEvent::CaptureStopped);
            }
            Ok(())
        } else {
            info!(event = "unmuted", "Microphone unmuted");
            let settle = self.config.analyzer.recalibration_settle_ms;
            self.start_capture(now_ms, settle)
        }
    }

    fn halt_analysis(&mut self) {
        self.vad.reset();
        self.recording.discard();
        self.analyzer.cancel_calibration();
        self.calibration_due_ms = None;
        self.window.clear();
    }

    fn sync_pause(&mut self, now_ms: u64) {
        let paused = self.control.is_paused();
        if paused == self.paused {
            return;
        }
        self.paused = paused;
        self.events.emit(CallEvent::PauseChanged { paused });
        if paused {
            info!(event = "paused", "Analysis paused");
            self.halt_analysis();
        } else {
            info!(event = "resumed", "Analysis resumed");
            self.calibration_due_ms = Some(now_ms + self.config.analyzer.recalibration_settle_ms);
            if self.config.eager_recording {
                self.start_recording(now_ms);
            }
        }
    }

    /// Release every audio resource. The session cannot be reopened.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.halt_analysis();
        if self.capture.is_active() {
            self.capture.stop();
            self.events.emit(CallEvent::CaptureStopped);
        }
        self.open = false;
        info!(
            event = "session_closed",
            utterances = self.stats.utterances,
            spurious_triggers = self.stats.spurious_triggers,
            speech_ms = self.stats.speech_ms,
            "Voice session closed"
        );
        self.events.emit(CallEvent::Closed);
    }

    /// Earliest pending deadline: silence timer, scheduled dispatch or calibration start
    pub fn next_deadline_ms(&self) -> Option<u64> {
        match (self.vad.next_deadline_ms(), self.calibration_due_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn control(&self) -> CaptureControl {
        self.control.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_active()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_recording()
    }

    pub fn phase(&self) -> VadPhase {
        self.vad.phase()
    }

    pub fn pending_timer_count(&self) -> usize {
        self.vad.pending_timer_count() + usize::from(self.calibration_due_ms.is_some())
    }

    pub fn noise_floor(&self) -> f32 {
        self.analyzer.noise_floor()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_control_is_shared() {
        let control = CaptureControl::default();
        let other = control.clone();
        other.pause();
        assert!(control.is_paused());
        assert!(!control.toggle());
        assert!(!other.is_paused());
        assert!(other.toggle());
        assert!(control.is_paused());
    }
}
