use anyhow::{Context, Result};
use rubato::{FftFixedIn, Resampler};
use tracing::debug;

/// Chunk size fed to the FFT resampler
const INPUT_FRAMES: usize = 1024;

/// Converts a finished recording from the device rate to the upload rate
pub struct AudioResampler {
    resampler: FftFixedIn<f32>,
    input_buffer: Vec<Vec<f32>>,
    output_buffer: Vec<Vec<f32>>,
    from_rate: u32,
    to_rate: u32,
}

impl AudioResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        debug!(
            "Creating resampler: {} Hz -> {} Hz (ratio: {:.4})",
            from_rate,
            to_rate,
            to_rate as f64 / from_rate as f64
        );

        let resampler = FftFixedIn::new(from_rate as usize, to_rate as usize, INPUT_FRAMES, 2, 1)
            .context("Failed to create resampler")?;
        let output_buffer = resampler.output_buffer_allocate(true);

        Ok(Self {
            resampler,
            input_buffer: vec![vec![0.0f32; INPUT_FRAMES]],
            output_buffer,
            from_rate,
            to_rate,
        })
    }

    /// Resample a complete mono buffer. The tail is zero-padded to a whole
    /// chunk and the output trimmed to the expected length.
    pub fn process_all(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let expected_len =
            (input.len() as u64 * self.to_rate as u64 / self.from_rate as u64) as usize;
        let delay = self.resampler.output_delay();
        let mut output = Vec::with_capacity(expected_len + delay);

        let mut offset = 0;
        // Keep feeding zeros until the resampler delay has been flushed out
        while output.len() < expected_len + delay {
            let end = (offset + INPUT_FRAMES).min(input.len());
            let chunk = if offset < end { &input[offset..end] } else { &[][..] };
            self.input_buffer[0][..chunk.len()].copy_from_slice(chunk);
            self.input_buffer[0][chunk.len()..].fill(0.0);
            offset = end;

            let (_, output_frames) = self
                .resampler
                .process_into_buffer(&self.input_buffer, &mut self.output_buffer, None)
                .context("Resampling failed")?;
            output.extend_from_slice(&self.output_buffer[0][..output_frames]);
        }

        let end = (delay + expected_len).min(output.len());
        Ok(output[delay.min(end)..end].to_vec())
    }

    pub fn reset(&mut self) {
        self.resampler.reset();
    }
}

/// Resample `samples` unless the rates already match
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    AudioResampler::new(from_rate, to_rate)?.process_all(samples)
}
