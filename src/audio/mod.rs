pub mod capture;
pub mod resampler;
pub mod wav;

pub use capture::{
    calculate_ring_buffer_capacity, get_device, list_input_devices, select_input_config,
    AudioCapture, AudioDevice, CaptureSource, CpalMicrophone, InputStream, MicrophoneProvider,
};
pub use resampler::{resample, AudioResampler};
pub use wav::{encode_wav, WAV_MIME_TYPE};
