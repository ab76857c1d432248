use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;

use crate::error::CallError;

/// Container type every finished utterance is tagged with
pub const WAV_MIME_TYPE: &str = "audio/wav";

/// Encode mono f32 samples as a 16-bit PCM WAV file in memory
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, CallError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer =
            WavWriter::new(&mut cursor, spec).map_err(|e| CallError::Encoding(e.to_string()))?;
        for &sample in samples {
            let clamped = sample.clamp(-1.0, 1.0);
            writer
                .write_sample((clamped * i16::MAX as f32) as i16)
                .map_err(|e| CallError::Encoding(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| CallError::Encoding(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
