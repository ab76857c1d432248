use crate::config::VadTuning;

/// Enter/exit pair derived from one effective noise level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub enter: f32,
    pub exit: f32,
}

/// Noise level the thresholds are built on
pub fn effective_noise(base_noise: f32, tuning: &VadTuning) -> f32 {
    base_noise + tuning.effective_noise_gap
}

/// Enter always sits above exit so the classification cannot chatter at the boundary
pub fn thresholds(effective_noise: f32, tuning: &VadTuning) -> Thresholds {
    Thresholds {
        enter: (effective_noise + tuning.enter_gap).max(tuning.enter_min),
        exit: (effective_noise + tuning.exit_gap).max(tuning.exit_min),
    }
}

/// Level below which an ongoing utterance counts as silent
pub fn dynamic_exit(
    exit: f32,
    effective_noise: f32,
    speech_level: f32,
    post_session_boost: Option<f32>,
    tuning: &VadTuning,
) -> f32 {
    exit.max(speech_level * tuning.voice_exit_ratio)
        .max(effective_noise + tuning.silence_floor_gap)
        .max(post_session_boost.unwrap_or(0.0))
}

/// Threshold armed after a session ends to keep trailing noise from re-triggering
pub fn post_session_boost(effective_noise: f32, speech_level: f32, tuning: &VadTuning) -> f32 {
    (effective_noise + tuning.post_session_boost_gap)
        .max(speech_level * tuning.voice_exit_ratio)
        .max(tuning.post_session_boost_min)
}

/// Inputs to the finalize decision when the silence timer fires
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinalizeInputs {
    pub recorded_ms: u64,
    pub speaking_ms: u64,
    pub smoothed_rms: f32,
    pub base_noise: f32,
}

/// Duration gate that keeps coughs and clicks from being sent
pub fn passes_finalize_gate(inputs: &FinalizeInputs, tuning: &VadTuning) -> bool {
    let approx_equal = (inputs.smoothed_rms - inputs.base_noise).abs() <= tuning.approx_equal_epsilon;
    let long_enough = inputs.recorded_ms >= tuning.min_record_ms
        || (approx_equal && inputs.recorded_ms >= tuning.short_gate_ms);
    long_enough && inputs.speaking_ms >= tuning.min_speech_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tuning() -> VadTuning {
        VadTuning::default()
    }

    fn gate(recorded_ms: u64, speaking_ms: u64, smoothed_rms: f32, base_noise: f32) -> bool {
        passes_finalize_gate(
            &FinalizeInputs {
                recorded_ms,
                speaking_ms,
                smoothed_rms,
                base_noise,
            },
            &tuning(),
        )
    }

    #[test]
    fn test_thresholds_from_noise() {
        let t = tuning();
        let eff = effective_noise(0.01, &t);
        assert!((eff - 0.015).abs() < 1e-6);
        let th = thresholds(eff, &t);
        assert!((th.enter - 0.033).abs() < 1e-6);
        assert!((th.exit - 0.023).abs() < 1e-6);
    }

    #[test]
    fn test_finalize_gate_boundary() {
        // Clearly not noise
        assert!(!gate(299, 250, 0.05, 0.001));
        assert!(gate(300, 250, 0.05, 0.001));
    }

    #[test]
    fn test_short_gate_exception() {
        assert!(gate(120, 200, 0.0015, 0.001));
        assert!(!gate(119, 200, 0.0015, 0.001));
    }

    #[test]
    fn test_gate_requires_min_speech() {
        assert!(!gate(5000, 199, 0.05, 0.001));
        assert!(!gate(120, 199, 0.001, 0.001));
    }

    #[test]
    fn test_dynamic_exit_follows_speech_level() {
        let t = tuning();
        let eff = effective_noise(0.001, &t);
        let th = thresholds(eff, &t);
        let exit = dynamic_exit(th.exit, eff, 0.1, None, &t);
        assert!((exit - 0.045).abs() < 1e-6);
    }

    #[test]
    fn test_dynamic_exit_respects_boost() {
        let t = tuning();
        let eff = effective_noise(0.001, &t);
        let th = thresholds(eff, &t);
        assert_eq!(dynamic_exit(th.exit, eff, 0.0, Some(0.2), &t), 0.2);
    }

    #[test]
    fn test_post_session_boost_floor() {
        let t = tuning();
        assert_eq!(post_session_boost(0.0, 0.0, &t), 0.01);
        assert!((post_session_boost(0.0, 0.1, &t) - 0.045).abs() < 1e-6);
    }

    proptest! {
        #[test]
        fn prop_enter_above_exit(noise in 0.0f32..1.0) {
            let t = tuning();
            let th = thresholds(effective_noise(noise, &t), &t);
            prop_assert!(th.enter > th.exit);
        }

        #[test]
        fn prop_dynamic_exit_never_below_exit(
            noise in 0.0f32..0.5,
            level in 0.0f32..1.0,
        ) {
            let t = tuning();
            let eff = effective_noise(noise, &t);
            let th = thresholds(eff, &t);
            prop_assert!(dynamic_exit(th.exit, eff, level, None, &t) >= th.exit);
        }
    }
}
