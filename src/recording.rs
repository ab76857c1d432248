use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::capture::CaptureSource;
use crate::audio::resampler::resample;
use crate::audio::wav::{encode_wav, WAV_MIME_TYPE};
use crate::config::RecordingTuning;
use crate::error::CallError;

/// A finished utterance, ready for the send collaborator
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub mime_type: &'static str,
    pub sample_rate: u32,
    pub duration_ms: u64,
    pub bytes: Vec<u8>,
}

/// Audio captured since the recording opened
#[derive(Debug)]
struct RecordingBuffer {
    chunks: VecDeque<Vec<f32>>,
    started_at_ms: u64,
    recorded_at: DateTime<Utc>,
    sample_rate: u32,
    total_samples: usize,
    trimmed: bool,
}

impl RecordingBuffer {
    fn duration_ms(&self) -> u64 {
        self.total_samples as u64 * 1000 / self.sample_rate.max(1) as u64
    }
}

pub struct RecordingController {
    tuning: RecordingTuning,
    buffer: Option<RecordingBuffer>,
}

impl RecordingController {
    pub fn new(tuning: RecordingTuning) -> Self {
        Self {
            tuning,
            buffer: None,
        }
    }

    /// Open a recording on the capture source unless one is already open.
    /// Returns whether a new recording was started.
    pub fn start_if_needed(&mut self, capture: &CaptureSource, now_ms: u64) -> Result<bool, CallError> {
        if self.buffer.is_some() {
            return Ok(false);
        }

        let sample_rate = match capture.sample_rate() {
            Some(rate) if capture.is_healthy() => rate,
            Some(_) => {
                return Err(CallError::TransientCaptureFailure(
                    "input stream reported an error".to_string(),
                ))
            }
            None => {
                return Err(CallError::TransientCaptureFailure(
                    "no active input stream".to_string(),
                ))
            }
        };

        self.buffer = Some(RecordingBuffer {
            chunks: VecDeque::new(),
            started_at_ms: now_ms,
            recorded_at: Utc::now(),
            sample_rate,
            total_samples: 0,
            trimmed: false,
        });
        info!(event = "recording_started", sample_rate, "Recording started");
        Ok(true)
    }

    /// Buffer captured samples if a recording is open
    pub fn append(&mut self, samples: &[f32]) {
        let Some(buffer) = self.buffer.as_mut() else {
            return;
        };
        if samples.is_empty() {
            return;
        }
        buffer.chunks.push_back(samples.to_vec());
        buffer.total_samples += samples.len();

        let max_samples =
            (self.tuning.max_buffer_ms * buffer.sample_rate as u64 / 1000).max(1) as usize;
        while buffer.total_samples > max_samples && buffer.chunks.len() > 1 {
            if let Some(dropped) = buffer.chunks.pop_front() {
                buffer.total_samples -= dropped.len();
            }
            if !buffer.trimmed {
                warn!(
                    "Recording exceeded {}ms without being sent, dropping oldest audio",
                    self.tuning.max_buffer_ms
                );
                buffer.trimmed = true;
            }
        }
    }

    /// Close the recording and produce one WAV clip from everything buffered.
    /// `final_chunk` carries samples captured since the last `append`.
    pub fn stop_and_finalize(&mut self, final_chunk: &[f32]) -> Result<Option<AudioClip>, CallError> {
        self.append(final_chunk);
        let Some(buffer) = self.buffer.take() else {
            debug!("No open recording to finalize");
            return Ok(None);
        };
        if buffer.total_samples == 0 {
            debug!("Recording closed without any audio");
            return Ok(None);
        }

        let duration_ms = buffer.duration_ms();
        let mut samples = Vec::with_capacity(buffer.total_samples);
        for chunk in &buffer.chunks {
            samples.extend_from_slice(chunk);
        }

        let sample_rate = self.tuning.output_sample_rate.unwrap_or(buffer.sample_rate);
        let samples = resample(&samples, buffer.sample_rate, sample_rate)
            .map_err(|e| CallError::Encoding(format!("{:#}", e)))?;
        let bytes = encode_wav(&samples, sample_rate)?;

        info!(
            event = "recording_finalized",
            duration_ms,
            bytes = bytes.len(),
            "Recording finalized"
        );

        Ok(Some(AudioClip {
            id: Uuid::new_v4(),
            recorded_at: buffer.recorded_at,
            mime_type: WAV_MIME_TYPE,
            sample_rate,
            duration_ms,
            bytes,
        }))
    }

    /// Drop the open recording without producing anything
    pub fn discard(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            debug!("Discarded {}ms of recorded audio", buffer.duration_ms());
        }
    }

    pub fn is_recording(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn started_at_ms(&self) -> Option<u64> {
        self.buffer.as_ref().map(|b| b.started_at_ms)
    }

    pub fn buffered_ms(&self) -> u64 {
        self.buffer.as_ref().map(|b| b.duration_ms()).unwrap_or(0)
    }
}
