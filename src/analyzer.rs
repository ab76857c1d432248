//! Signal analyzer
//!
//! Turns captured frames into an RMS level and an adaptive ambient noise
//! floor. The noise estimate rises slowly and falls quickly, and is frozen
//! against rising for a hold window after any activity so that speech never
//! inflates it.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::config::AnalyzerTuning;

/// One analysis window of captured samples
#[derive(Debug, Clone, Copy)]
pub struct AudioFrame<'a> {
    pub samples: &'a [f32],
    pub captured_at_ms: u64,
}

/// Output of one analyzer tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyReading {
    pub rms: f32,
    /// Last published noise floor, never below the configured minimum
    pub noise_floor: f32,
    /// Whether this tick looked like activity to the estimator
    pub is_active: bool,
    /// True on ticks where `noise_floor` was refreshed
    pub published: bool,
}

/// Root-mean-square of normalized samples
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    energy.sqrt()
}

fn blend(old: f32, sample: f32, alpha: f32) -> f32 {
    old * (1.0 - alpha) + sample * alpha
}

#[derive(Debug, Clone)]
struct Calibration {
    ends_at_ms: u64,
    sum: f64,
    count: u32,
}

pub struct SignalAnalyzer {
    tuning: AnalyzerTuning,
    noise_estimate: f32,
    hold_until_ms: Option<u64>,
    published_floor: f32,
    last_publish_ms: Option<u64>,
    conversation_baseline: f32,
    ambient_noise: Option<f32>,
    calibration: Option<Calibration>,
}

impl SignalAnalyzer {
    pub fn new(tuning: AnalyzerTuning) -> Self {
        let published_floor = tuning.noise_floor_min;
        Self {
            tuning,
            noise_estimate: 0.0,
            hold_until_ms: None,
            published_floor,
            last_publish_ms: None,
            conversation_baseline: 0.0,
            ambient_noise: None,
            calibration: None,
        }
    }

    /// Analyse one frame. Returns `None` when the frame is unusable, in which
    /// case the tick is skipped and no state changes.
    pub fn process(&mut self, frame: AudioFrame<'_>) -> Option<EnergyReading> {
        if frame.samples.is_empty() {
            return None;
        }
        let level = rms(frame.samples);
        if !level.is_finite() {
            debug!("Skipping analyzer tick with non-finite RMS");
            return None;
        }
        Some(self.update(level, frame.captured_at_ms))
    }

    /// Feed one RMS sample into the noise estimator
    pub fn update(&mut self, rms: f32, now_ms: u64) -> EnergyReading {
        let t = &self.tuning;
        let prev = self.noise_estimate;
        let is_active = rms > prev + t.activity_abs_gap || rms > prev * t.activity_ratio;

        if is_active {
            self.noise_estimate *= t.active_decay;
            self.hold_until_ms = Some(now_ms + t.hold_ms);
        } else if self.hold_until_ms.map_or(false, |until| now_ms < until) {
            if rms < self.noise_estimate {
                self.noise_estimate = blend(self.noise_estimate, rms, t.alpha_fall);
            } else {
                self.noise_estimate *= t.hold_decay;
            }
        } else if rms > self.noise_estimate {
            self.noise_estimate = blend(self.noise_estimate, rms, t.alpha_rise);
        } else {
            self.noise_estimate = blend(self.noise_estimate, rms, t.alpha_fall);
        }

        if !is_active {
            self.conversation_baseline = blend(self.conversation_baseline, rms, t.baseline_alpha);
        }

        let mut force_publish = false;
        if let Some(cal) = self.calibration.as_mut() {
            cal.sum += rms as f64;
            cal.count += 1;
            if now_ms >= cal.ends_at_ms {
                let mean = (cal.sum / cal.count as f64) as f32;
                self.calibration = None;
                self.seed(mean);
                force_publish = true;
                info!(
                    event = "ambient_calibrated",
                    ambient_noise = mean,
                    "Ambient noise calibration complete"
                );
            }
        }

        let due = self
            .last_publish_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.tuning.publish_interval_ms);
        let published = force_publish || due;
        if published {
            self.published_floor = self.noise_estimate.max(self.tuning.noise_floor_min);
            self.last_publish_ms = Some(now_ms);
            trace!(noise_floor = self.published_floor, rms, "Noise floor published");
        }

        EnergyReading {
            rms,
            noise_floor: self.published_floor,
            is_active,
            published,
        }
    }

    /// Collect RMS for the calibration window, then seed the estimator with its mean
    pub fn start_calibration(&mut self, now_ms: u64) {
        debug!("Ambient calibration started ({}ms window)", self.tuning.calibration_ms);
        self.calibration = Some(Calibration {
            ends_at_ms: now_ms + self.tuning.calibration_ms,
            sum: 0.0,
            count: 0,
        });
    }

    pub fn cancel_calibration(&mut self) {
        self.calibration = None;
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibration.is_some()
    }

    fn seed(&mut self, level: f32) {
        self.noise_estimate = level;
        self.conversation_baseline = level;
        self.ambient_noise = Some(level);
        self.hold_until_ms = None;
    }

    pub fn noise_floor(&self) -> f32 {
        self.published_floor
    }

    /// Unthrottled internal estimate
    pub fn noise_estimate(&self) -> f32 {
        self.noise_estimate
    }

    pub fn conversation_baseline(&self) -> f32 {
        self.conversation_baseline
    }

    /// Mean level measured by the last completed calibration
    pub fn ambient_noise(&self) -> Option<f32> {
        self.ambient_noise
    }
}

/// Magnitude spectrum for level meters
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    size: usize,
    bins: usize,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
}

impl SpectrumAnalyzer {
    pub fn new(size: usize, bins: usize) -> Self {
        let size = size.max(2);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(size);
        // Hann window
        let window = (0..size)
            .map(|i| {
                0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos()
            })
            .collect();
        Self {
            fft,
            size,
            bins: bins.clamp(1, size / 2),
            window,
            buffer: vec![Complex::new(0.0, 0.0); size],
        }
    }

    /// Average magnitudes of the most recent `size` samples, grouped into `bins` bands
    pub fn magnitudes(&mut self, samples: &[f32]) -> Vec<f32> {
        let tail = &samples[samples.len().saturating_sub(self.size)..];
        let pad = self.size - tail.len();
        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = if i < pad { 0.0 } else { tail[i - pad] };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.buffer);

        let half = self.size / 2;
        let per_bin = half / self.bins;
        let scale = 2.0 / self.size as f32;
        (0..self.bins)
            .map(|b| {
                let band = &self.buffer[b * per_bin..(b + 1) * per_bin];
                band.iter().map(|c| c.norm() * scale).sum::<f32>() / per_bin as f32
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn analyzer() -> SignalAnalyzer {
        SignalAnalyzer::new(AnalyzerTuning::default())
    }

    /// Settle the estimator at `level` with calibration
    fn calibrated_at(level: f32) -> SignalAnalyzer {
        let mut a = analyzer();
        a.start_calibration(0);
        let mut now = 0;
        while a.is_calibrating() {
            a.update(level, now);
            now += 16;
        }
        a
    }

    #[test]
    fn test_rms_of_square_wave() {
        let samples: Vec<f32> = (0..100).map(|i| if i % 2 == 0 { 0.3 } else { -0.3 }).collect();
        assert!((rms(&samples) - 0.3).abs() < 1e-6);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn test_empty_and_non_finite_frames_are_skipped() {
        let mut a = analyzer();
        assert!(a.process(AudioFrame { samples: &[], captured_at_ms: 0 }).is_none());
        let bad = [f32::NAN, 0.1];
        assert!(a.process(AudioFrame { samples: &bad, captured_at_ms: 0 }).is_none());
        assert_eq!(a.noise_estimate(), 0.0);
    }

    #[test]
    fn test_calibration_seeds_noise_floor() {
        let a = calibrated_at(0.004);
        assert!((a.noise_estimate() - 0.004).abs() < 1e-6);
        assert!((a.noise_floor() - 0.004).abs() < 1e-6);
        assert_eq!(a.ambient_noise(), Some(0.004));
        assert!((a.conversation_baseline() - 0.004).abs() < 1e-6);
    }

    #[test]
    fn test_published_floor_is_clamped_to_minimum() {
        let mut a = analyzer();
        let reading = a.update(0.0, 0);
        assert!(reading.published);
        assert_eq!(reading.noise_floor, 0.0005);
    }

    #[test]
    fn test_publication_is_throttled() {
        let mut a = calibrated_at(0.01);
        let start = 10_000;
        let first = a.update(0.01, start);
        assert!(first.published);
        let second = a.update(0.01, start + 100);
        assert!(!second.published);
        let third = a.update(0.01, start + 180);
        assert!(third.published);
    }

    #[test]
    fn test_hold_window_suppresses_re_rise() {
        let mut a = calibrated_at(0.01);
        let t0 = 5_000;
        let reading = a.update(0.2, t0);
        assert!(reading.is_active);
        let after_activity = a.noise_estimate();

        // Back at the noise floor, then slightly above it: no rise while held
        let mut now = t0 + 16;
        let mut last = after_activity;
        while now < t0 + 3000 {
            a.update(last, now);
            assert!(a.noise_estimate() <= last, "estimate rose inside hold window");
            last = a.noise_estimate();
            now += 16;
        }

        // Once the hold expires a louder floor may pull the estimate up
        let before = a.noise_estimate();
        a.update(before * 1.04, t0 + 3000);
        assert!(a.noise_estimate() > before);
    }

    #[test]
    fn test_quiet_after_hold_falls_fast() {
        let mut a = calibrated_at(0.02);
        a.update(0.01, 10_000);
        // alpha_fall = 0.35 toward the lower level
        assert!((a.noise_estimate() - (0.02 * 0.65 + 0.01 * 0.35)).abs() < 1e-6);
    }

    #[test]
    fn test_baseline_only_tracks_inactive_ticks() {
        let mut a = calibrated_at(0.01);
        let baseline = a.conversation_baseline();
        a.update(0.5, 10_000);
        assert_eq!(a.conversation_baseline(), baseline);
    }

    #[test]
    fn test_spectrum_peaks_at_tone() {
        let size = 1024;
        let mut spectrum = SpectrumAnalyzer::new(size, 32);
        // Tone at bin 80 of 512 -> band 5 of 32 (16 bins per band)
        let tone: Vec<f32> = (0..size)
            .map(|i| (2.0 * std::f32::consts::PI * 80.0 * i as f32 / size as f32).sin())
            .collect();
        let bands = spectrum.magnitudes(&tone);
        assert_eq!(bands.len(), 32);
        let peak = bands
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 5);
    }

    #[test]
    fn test_spectrum_handles_short_input() {
        let mut spectrum = SpectrumAnalyzer::new(256, 8);
        let bands = spectrum.magnitudes(&[0.1; 10]);
        assert_eq!(bands.len(), 8);
        assert!(bands.iter().all(|b| b.is_finite()));
    }

    proptest! {
        #[test]
        fn prop_no_rise_during_activity(
            start in 0.0f32..0.05,
            steps in proptest::collection::vec(0.0f32..0.5, 1..200)
        ) {
            let mut a = calibrated_at(start);
            let initial = a.noise_estimate();
            let mut now = 10_000;
            for step in steps {
                let rms = a.noise_estimate() + 0.0061 + step;
                a.update(rms, now);
                now += 16;
            }
            prop_assert!(a.noise_estimate() <= initial);
        }

        #[test]
        fn prop_published_floor_never_below_minimum(
            levels in proptest::collection::vec(0.0f32..1.0, 1..300)
        ) {
            let mut a = analyzer();
            for (i, level) in levels.into_iter().enumerate() {
                let reading = a.update(level, i as u64 * 16);
                prop_assert!(reading.noise_floor >= 0.0005);
                prop_assert!(reading.noise_floor.is_finite());
            }
        }
    }
}
