//! Speech session state machine
//!
//! Fed once per analyzer tick with the latest RMS and published noise floor.
//! Timers are plain deadlines on the caller's millisecond clock: the caller
//! runs `poll_timers` whenever it wakes up, and every expiry re-checks its
//! precondition before acting, so it does not matter whether a tick or a
//! timer wake-up is processed first.

use tracing::{debug, info};

use super::thresholds::{
    dynamic_exit, effective_noise, passes_finalize_gate, post_session_boost, thresholds,
    FinalizeInputs,
};
use crate::config::VadTuning;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SilenceTimer {
    pub armed_at_ms: u64,
    pub duration_ms: u64,
}

impl SilenceTimer {
    pub fn deadline_ms(&self) -> u64 {
        self.armed_at_ms + self.duration_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VadState {
    Idle,
    /// `baseline` is the noise floor frozen at speech onset
    Speaking { since_ms: u64, baseline: f32 },
    PendingSilence {
        since_ms: u64,
        baseline: f32,
        timer: SilenceTimer,
    },
    /// Session ended, dispatch scheduled
    Finalizing { dispatch_at_ms: u64 },
}

/// What the rest of the system gets to see; pending silence still counts as speaking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadPhase {
    Idle,
    Speaking,
    Finalizing,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VadEvent {
    SpeechStarted { at_ms: u64 },
    SpeechResumed { at_ms: u64 },
    SilencePending { at_ms: u64, timer_ms: u64 },
    /// Finalize gate rejected the session; the recording stays open
    SpuriousTrigger { recorded_ms: u64, speaking_ms: u64 },
    SessionFinalized {
        speaking_ms: u64,
        recorded_ms: u64,
        forced: bool,
    },
    /// Speech came back before a scheduled dispatch ran
    DispatchCancelled,
    /// The recording should be finalized and handed to the dispatch gate now
    DispatchDue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostSessionBoost {
    pub value: f32,
    pub expires_at_ms: u64,
}

pub struct VadMachine {
    tuning: VadTuning,
    state: VadState,
    smoothed_rms: f32,
    speech_level: f32,
    last_speech_ms: u64,
    boost: Option<PostSessionBoost>,
    /// Baseline carried through a spurious trigger; only finalize ends the session
    retained_baseline: Option<f32>,
}

impl VadMachine {
    pub fn new(tuning: VadTuning) -> Self {
        Self {
            tuning,
            state: VadState::Idle,
            smoothed_rms: 0.0,
            speech_level: 0.0,
            last_speech_ms: 0,
            boost: None,
            retained_baseline: None,
        }
    }

    /// Classify one tick
    pub fn on_tick(&mut self, rms: f32, noise_floor: f32, now_ms: u64) -> Vec<VadEvent> {
        let mut events = Vec::new();
        if !rms.is_finite() || !noise_floor.is_finite() {
            return events;
        }

        let alpha = self.tuning.rms_smoothing;
        self.smoothed_rms = self.smoothed_rms * (1.0 - alpha) + rms * alpha;
        let smoothed = self.smoothed_rms;

        let eff = effective_noise(self.base_noise(noise_floor), &self.tuning);
        let th = thresholds(eff, &self.tuning);
        let boost = self.active_boost(now_ms);

        match self.state {
            VadState::Idle | VadState::Finalizing { .. } => {
                if smoothed >= th.enter {
                    if matches!(self.state, VadState::Finalizing { .. }) {
                        debug!("Speech resumed before dispatch, cancelling scheduled send");
                        events.push(VadEvent::DispatchCancelled);
                    }
                    let baseline = self.retained_baseline.take().unwrap_or(noise_floor);
                    self.state = VadState::Speaking {
                        since_ms: now_ms,
                        baseline,
                    };
                    self.speech_level = smoothed;
                    self.last_speech_ms = now_ms;
                    info!(
                        event = "speech_started",
                        rms = smoothed,
                        noise_floor,
                        enter = th.enter,
                        "Speech started"
                    );
                    events.push(VadEvent::SpeechStarted { at_ms: now_ms });
                }
            }
            VadState::Speaking { since_ms, baseline } => {
                let retain = self.tuning.speech_level_retain;
                self.speech_level = self.speech_level * retain + smoothed * (1.0 - retain);
                let exit = dynamic_exit(th.exit, eff, self.speech_level, boost, &self.tuning);

                if smoothed >= exit {
                    self.last_speech_ms = now_ms;
                } else {
                    let timer = SilenceTimer {
                        armed_at_ms: now_ms,
                        duration_ms: self.tuning.session_end_silence_ms,
                    };
                    debug!(
                        "Below exit threshold ({:.4} < {:.4}), silence timer {}ms",
                        smoothed, exit, timer.duration_ms
                    );
                    self.state = VadState::PendingSilence {
                        since_ms,
                        baseline,
                        timer,
                    };
                    events.push(VadEvent::SilencePending {
                        at_ms: now_ms,
                        timer_ms: timer.duration_ms,
                    });
                }
            }
            VadState::PendingSilence {
                since_ms, baseline, ..
            } => {
                if smoothed >= th.enter {
                    self.state = VadState::Speaking { since_ms, baseline };
                    self.last_speech_ms = now_ms;
                    events.push(VadEvent::SpeechResumed { at_ms: now_ms });
                } else if smoothed
                    >= dynamic_exit(th.exit, eff, self.speech_level, boost, &self.tuning)
                {
                    // Weak voice keeps the pause from counting as silence
                    self.last_speech_ms = now_ms;
                }
            }
        }

        events
    }

    /// Run any expired timers. `recording_started_ms` is when the open
    /// recording began, if there is one.
    pub fn poll_timers(&mut self, now_ms: u64, recording_started_ms: Option<u64>) -> Vec<VadEvent> {
        let mut events = Vec::new();

        if let VadState::PendingSilence {
            since_ms,
            baseline,
            timer,
        } = self.state
        {
            if now_ms >= timer.deadline_ms() {
                let quiet_for = now_ms.saturating_sub(self.last_speech_ms);
                if quiet_for < timer.duration_ms {
                    // Voice arrived after the timer was armed
                    self.state = VadState::PendingSilence {
                        since_ms,
                        baseline,
                        timer: SilenceTimer {
                            armed_at_ms: self.last_speech_ms,
                            duration_ms: timer.duration_ms,
                        },
                    };
                } else {
                    let inputs = FinalizeInputs {
                        recorded_ms: recording_started_ms
                            .map(|started| now_ms.saturating_sub(started))
                            .unwrap_or(0),
                        speaking_ms: now_ms.saturating_sub(since_ms),
                        smoothed_rms: self.smoothed_rms,
                        base_noise: baseline,
                    };
                    if passes_finalize_gate(&inputs, &self.tuning) {
                        self.finalize(baseline, now_ms, &inputs, false, &mut events);
                    } else {
                        debug!(
                            event = "spurious_trigger",
                            recorded_ms = inputs.recorded_ms,
                            speaking_ms = inputs.speaking_ms,
                            "Finalize gate rejected session"
                        );
                        self.state = VadState::Idle;
                        self.retained_baseline = Some(baseline);
                        events.push(VadEvent::SpuriousTrigger {
                            recorded_ms: inputs.recorded_ms,
                            speaking_ms: inputs.speaking_ms,
                        });
                    }
                }
            }
        }

        if let VadState::Finalizing { dispatch_at_ms } = self.state {
            if now_ms >= dispatch_at_ms {
                self.state = VadState::Idle;
                events.push(VadEvent::DispatchDue);
            }
        }

        events
    }

    /// Explicit user flush: skips timers and duration gates
    pub fn force_finalize(&mut self, now_ms: u64, recording_started_ms: Option<u64>) -> Vec<VadEvent> {
        let mut events = Vec::new();
        let (since_ms, baseline) = match self.state {
            VadState::Speaking { since_ms, baseline }
            | VadState::PendingSilence {
                since_ms, baseline, ..
            } => (Some(since_ms), Some(baseline)),
            VadState::Idle | VadState::Finalizing { .. } => (None, None),
        };
        let inputs = FinalizeInputs {
            recorded_ms: recording_started_ms
                .map(|started| now_ms.saturating_sub(started))
                .unwrap_or(0),
            speaking_ms: since_ms.map(|s| now_ms.saturating_sub(s)).unwrap_or(0),
            smoothed_rms: self.smoothed_rms,
            base_noise: baseline.unwrap_or(0.0),
        };
        if let Some(baseline) = baseline {
            self.finalize(baseline, now_ms, &inputs, true, &mut events);
        } else {
            events.push(VadEvent::SessionFinalized {
                speaking_ms: 0,
                recorded_ms: inputs.recorded_ms,
                forced: true,
            });
        }
        self.state = VadState::Idle;
        self.retained_baseline = None;
        events.push(VadEvent::DispatchDue);
        events
    }

    fn finalize(
        &mut self,
        baseline: f32,
        now_ms: u64,
        inputs: &FinalizeInputs,
        forced: bool,
        events: &mut Vec<VadEvent>,
    ) {
        let eff = effective_noise(baseline, &self.tuning);
        let boost = PostSessionBoost {
            value: post_session_boost(eff, self.speech_level, &self.tuning),
            expires_at_ms: now_ms + self.tuning.post_session_boost_ms,
        };
        info!(
            event = "session_finalized",
            speaking_ms = inputs.speaking_ms,
            recorded_ms = inputs.recorded_ms,
            forced,
            boost = boost.value,
            "Speech session finalized"
        );
        self.boost = Some(boost);
        self.speech_level = 0.0;
        self.retained_baseline = None;
        self.state = VadState::Finalizing {
            dispatch_at_ms: now_ms + self.tuning.dispatch_delay_ms,
        };
        events.push(VadEvent::SessionFinalized {
            speaking_ms: inputs.speaking_ms,
            recorded_ms: inputs.recorded_ms,
            forced,
        });
    }

    /// Back to a clean idle state with no timers armed
    pub fn reset(&mut self) {
        self.state = VadState::Idle;
        self.smoothed_rms = 0.0;
        self.speech_level = 0.0;
        self.last_speech_ms = 0;
        self.boost = None;
        self.retained_baseline = None;
    }

    fn base_noise(&self, noise_floor: f32) -> f32 {
        self.session_baseline().unwrap_or(noise_floor)
    }

    fn active_boost(&mut self, now_ms: u64) -> Option<f32> {
        match self.boost {
            Some(boost) if now_ms < boost.expires_at_ms => Some(boost.value),
            Some(_) => {
                self.boost = None;
                None
            }
            None => None,
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    pub fn phase(&self) -> VadPhase {
        match self.state {
            VadState::Idle => VadPhase::Idle,
            VadState::Speaking { .. } | VadState::PendingSilence { .. } => VadPhase::Speaking,
            VadState::Finalizing { .. } => VadPhase::Finalizing,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.phase() == VadPhase::Speaking
    }

    pub fn in_session(&self) -> bool {
        self.session_baseline().is_some()
    }

    pub fn session_baseline(&self) -> Option<f32> {
        match self.state {
            VadState::Speaking { baseline, .. } | VadState::PendingSilence { baseline, .. } => {
                Some(baseline)
            }
            VadState::Idle => self.retained_baseline,
            VadState::Finalizing { .. } => None,
        }
    }

    pub fn speaking_started_ms(&self) -> Option<u64> {
        match self.state {
            VadState::Speaking { since_ms, .. } | VadState::PendingSilence { since_ms, .. } => {
                Some(since_ms)
            }
            _ => None,
        }
    }

    pub fn smoothed_rms(&self) -> f32 {
        self.smoothed_rms
    }

    pub fn speech_level(&self) -> f32 {
        self.speech_level
    }

    pub fn post_session_boost(&self) -> Option<PostSessionBoost> {
        self.boost
    }

    /// Silence timer and scheduled dispatch currently armed
    pub fn pending_timer_count(&self) -> usize {
        match self.state {
            VadState::PendingSilence { .. } | VadState::Finalizing { .. } => 1,
            _ => 0,
        }
    }

    pub fn next_deadline_ms(&self) -> Option<u64> {
        match self.state {
            VadState::PendingSilence { timer, .. } => Some(timer.deadline_ms()),
            VadState::Finalizing { dispatch_at_ms } => Some(dispatch_at_ms),
            _ => None,
        }
    }
}
