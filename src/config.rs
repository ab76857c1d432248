use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: u32,
    pub input_device_id: Option<String>,

    /// Directory finished utterances are written to when no upload URL is set
    pub output_dir: Option<PathBuf>,
    /// Endpoint that receives finished utterances as multipart uploads
    pub upload_url: Option<String>,

    /// Analyzer + VAD tick period
    pub tick_ms: u64,
    pub start_muted: bool,
    /// Open a recording as soon as the microphone opens instead of waiting for speech
    pub eager_recording: bool,

    pub analyzer: AnalyzerTuning,
    pub vad: VadTuning,
    pub recording: RecordingTuning,
    pub dispatch: DispatchTuning,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: 1,
            input_device_id: None,
            output_dir: None,
            upload_url: None,
            tick_ms: 16,
            start_muted: false,
            eager_recording: true,
            analyzer: AnalyzerTuning::default(),
            vad: VadTuning::default(),
            recording: RecordingTuning::default(),
            dispatch: DispatchTuning::default(),
        }
    }
}

impl Config {
    /// Load config from file, or create default
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            serde_json::from_str(&content).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).context("Failed to write config file")
    }

    /// Get the default config directory
    pub fn default_config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".voicegate"))
    }

    pub fn default_config_path() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.json"))
    }

    /// Directory utterances land in when neither `output_dir` nor an upload URL is set
    pub fn default_output_dir() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("utterances"))
    }

    pub fn resolved_output_dir(&self) -> Result<PathBuf> {
        match &self.output_dir {
            Some(dir) => Ok(dir.clone()),
            None => Self::default_output_dir(),
        }
    }
}

/// Noise-floor estimator constants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerTuning {
    /// Samples per analysed frame
    pub frame_size: usize,
    /// Number of magnitude bins published for meters
    pub spectrum_bins: usize,
    pub activity_abs_gap: f32,
    pub activity_ratio: f32,
    pub hold_ms: u64,
    pub active_decay: f32,
    pub hold_decay: f32,
    pub alpha_fall: f32,
    pub alpha_rise: f32,
    pub baseline_alpha: f32,
    pub publish_interval_ms: u64,
    pub noise_floor_min: f32,
    pub calibration_ms: u64,
    /// Delay between unmute/resume and the ambient recalibration
    pub recalibration_settle_ms: u64,
}

impl Default for AnalyzerTuning {
    fn default() -> Self {
        Self {
            frame_size: 2048,
            spectrum_bins: 32,
            activity_abs_gap: 0.006,
            activity_ratio: 1.05,
            hold_ms: 3000,
            active_decay: 0.995,
            hold_decay: 0.997,
            alpha_fall: 0.35,
            alpha_rise: 0.06,
            baseline_alpha: 0.005,
            publish_interval_ms: 180,
            noise_floor_min: 0.0005,
            calibration_ms: 2000,
            recalibration_settle_ms: 80,
        }
    }
}

/// Speech/silence classification constants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadTuning {
    pub effective_noise_gap: f32,
    pub enter_gap: f32,
    pub enter_min: f32,
    pub exit_gap: f32,
    pub exit_min: f32,
    /// Weight of the newest RMS sample in the fast smoothing EMA
    pub rms_smoothing: f32,
    /// Weight kept from the previous short-term speech level
    pub speech_level_retain: f32,
    /// Fraction of the short-term speech level below which speech counts as ended
    pub voice_exit_ratio: f32,
    pub silence_floor_gap: f32,
    pub session_end_silence_ms: u64,
    pub min_record_ms: u64,
    pub short_gate_ms: u64,
    pub min_speech_ms: u64,
    pub approx_equal_epsilon: f32,
    pub post_session_boost_gap: f32,
    pub post_session_boost_min: f32,
    pub post_session_boost_ms: u64,
    /// Wait between a finalized session and its dispatch
    pub dispatch_delay_ms: u64,
}

impl Default for VadTuning {
    fn default() -> Self {
        Self {
            effective_noise_gap: 0.005,
            enter_gap: 0.018,
            enter_min: 0.001,
            exit_gap: 0.008,
            exit_min: 0.0005,
            rms_smoothing: 0.5,
            speech_level_retain: 0.75,
            voice_exit_ratio: 0.45,
            silence_floor_gap: 0.007,
            session_end_silence_ms: 700,
            min_record_ms: 300,
            short_gate_ms: 120,
            min_speech_ms: 200,
            approx_equal_epsilon: 0.001,
            post_session_boost_gap: 0.008,
            post_session_boost_min: 0.01,
            post_session_boost_ms: 1000,
            dispatch_delay_ms: 150,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingTuning {
    /// Longest span of audio a recording buffer keeps; older chunks are dropped
    pub max_buffer_ms: u64,
    /// Rate finished utterances are resampled to; `None` keeps the device rate
    pub output_sample_rate: Option<u32>,
}

impl Default for RecordingTuning {
    fn default() -> Self {
        Self {
            max_buffer_ms: 60_000,
            output_sample_rate: Some(16_000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchTuning {
    pub timeout_ms: u64,
    /// Consecutive failures before the UI is told
    pub failure_notice_threshold: u32,
}

impl Default for DispatchTuning {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            failure_notice_threshold: 3,
        }
    }
}
