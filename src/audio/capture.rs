use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SizedSample, Stream, StreamConfig};
use ringbuf::traits::{Consumer as ConsumerTrait, Producer as ProducerTrait, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::CallError;

/// Audio device information
#[derive(Debug, Clone)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

/// List available input devices
pub fn list_input_devices() -> Result<Vec<AudioDevice>> {
    let host = cpal::default_host();
    let default_name = host
        .default_input_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();

    let mut devices = Vec::new();
    for device in host.input_devices().context("Failed to enumerate input devices")? {
        if let Ok(name) = device.name() {
            devices.push(AudioDevice {
                id: name.clone(),
                is_default: name == default_name,
                name,
            });
        }
    }

    Ok(devices)
}

/// Get device by ID (name) or return default
pub fn get_device(device_id: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    match device_id {
        Some(id) if id != "default" => {
            for device in host.input_devices().context("Failed to enumerate devices")? {
                if device.name().map(|n| n == id).unwrap_or(false) {
                    return Ok(device);
                }
            }
            anyhow::bail!("Device not found: {}", id);
        }
        _ => host
            .default_input_device()
            .context("No default input device available"),
    }
}

/// Selected audio configuration with both stream config and sample format
pub struct SelectedConfig {
    pub config: StreamConfig,
    pub sample_format: SampleFormat,
}

/// Prefer a mono configuration, otherwise take the device default and keep the first channel
pub fn select_input_config(device: &Device) -> Result<SelectedConfig> {
    if let Ok(supported) = device.supported_input_configs() {
        for config_range in supported {
            if config_range.channels() == 1 {
                let supported_config = config_range.with_max_sample_rate();
                debug!(
                    "Selected mono config: {} Hz, format {:?}",
                    supported_config.sample_rate().0,
                    supported_config.sample_format()
                );
                return Ok(SelectedConfig {
                    sample_format: supported_config.sample_format(),
                    config: supported_config.into(),
                });
            }
        }
    }

    let supported_config = device
        .default_input_config()
        .context("No default input config")?;
    debug!(
        "Using default config (first channel only): {} Hz, {} channels, format {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );
    Ok(SelectedConfig {
        sample_format: supported_config.sample_format(),
        config: supported_config.into(),
    })
}

/// Ring buffer capacity for the given sample rate. The tick loop drains it
/// every few milliseconds, so a few seconds of slack is plenty.
pub fn calculate_ring_buffer_capacity(device_sample_rate: u32) -> usize {
    const BUFFER_DURATION_SECONDS: u32 = 5;
    (device_sample_rate * BUFFER_DURATION_SECONDS) as usize
}

/// Grants exclusive access to a microphone.
pub trait MicrophoneProvider {
    /// Open and start a capture stream. Any failure is `DeviceUnavailable`.
    fn acquire(&mut self) -> Result<Box<dyn InputStream>, CallError>;
}

/// A running capture stream. Dropping it releases the device.
pub trait InputStream {
    fn sample_rate(&self) -> u32;

    /// Move every sample captured since the last call into `out`.
    fn drain_into(&mut self, out: &mut Vec<f32>) -> usize;

    /// False once the backend reported an error (device unplugged, permission revoked).
    fn is_healthy(&self) -> bool {
        true
    }
}

/// The microphone side of a voice session.
///
/// `start` is a no-op while a stream is open and `stop` is safe to call at
/// any time.
pub struct CaptureSource {
    provider: Box<dyn MicrophoneProvider>,
    stream: Option<Box<dyn InputStream>>,
}

impl CaptureSource {
    pub fn new(provider: Box<dyn MicrophoneProvider>) -> Self {
        Self {
            provider,
            stream: None,
        }
    }

    pub fn start(&mut self) -> Result<(), CallError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = self.provider.acquire()?;
        info!(
            event = "capture_started",
            sample_rate = stream.sample_rate(),
            "Microphone capture started"
        );
        self.stream = Some(stream);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            info!(event = "capture_stopped", "Microphone capture released");
        }
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_healthy(&self) -> bool {
        self.stream.as_ref().map(|s| s.is_healthy()).unwrap_or(false)
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.stream.as_ref().map(|s| s.sample_rate())
    }

    pub fn drain_into(&mut self, out: &mut Vec<f32>) -> usize {
        match self.stream.as_mut() {
            Some(stream) => stream.drain_into(out),
            None => 0,
        }
    }
}

/// cpal-backed microphone
pub struct CpalMicrophone {
    device_id: Option<String>,
}

impl CpalMicrophone {
    pub fn new(device_id: Option<String>) -> Self {
        Self { device_id }
    }

    fn open(&self) -> Result<CpalInputStream> {
        let device = get_device(self.device_id.as_deref())?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let selected = select_input_config(&device)?;
        let sample_rate = selected.config.sample_rate.0;

        let ring_buffer = HeapRb::<f32>::new(calculate_ring_buffer_capacity(sample_rate));
        let (producer, consumer) = ring_buffer.split();

        let capture = AudioCapture::new(&device, &selected.config, selected.sample_format, producer)?;
        capture.start()?;
        info!("Using audio device: {}", device_name);

        Ok(CpalInputStream { capture, consumer })
    }
}

impl MicrophoneProvider for CpalMicrophone {
    fn acquire(&mut self) -> Result<Box<dyn InputStream>, CallError> {
        match self.open() {
            Ok(stream) => Ok(Box::new(stream)),
            Err(e) => {
                error!(event = "capture_unavailable", "Failed to open microphone: {:#}", e);
                Err(CallError::DeviceUnavailable(format!("{:#}", e)))
            }
        }
    }
}

struct CpalInputStream {
    capture: AudioCapture,
    consumer: HeapCons<f32>,
}

impl InputStream for CpalInputStream {
    fn sample_rate(&self) -> u32 {
        self.capture.sample_rate()
    }

    fn drain_into(&mut self, out: &mut Vec<f32>) -> usize {
        let mut chunk = [0.0f32; 1024];
        let mut total = 0;
        loop {
            let read = self.consumer.pop_slice(&mut chunk);
            if read == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..read]);
            total += read;
        }
        total
    }

    fn is_healthy(&self) -> bool {
        !self.capture.has_failed()
    }
}

impl Drop for CpalInputStream {
    fn drop(&mut self) {
        if let Err(e) = self.capture.stop() {
            warn!("Failed to pause input stream on release: {}", e);
        }
        if self.capture.overflow_count() > 0 {
            warn!("Audio overflows detected: {}", self.capture.overflow_count());
        }
    }
}

/// Audio capture handle
pub struct AudioCapture {
    stream: Stream,
    sample_rate: u32,
    overflow_counter: Arc<AtomicU64>,
    is_running: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

impl AudioCapture {
    /// Build an input stream that writes the first channel to the given ring buffer producer
    pub fn new(
        device: &Device,
        config: &StreamConfig,
        sample_format: SampleFormat,
        producer: HeapProd<f32>,
    ) -> Result<Self> {
        let sample_rate = config.sample_rate.0;
        let overflow_counter = Arc::new(AtomicU64::new(0));
        let is_running = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        info!(
            "Building input stream: {} Hz, {} channels, format {:?}",
            sample_rate, config.channels, sample_format
        );

        let taps = StreamTaps {
            channels: config.channels as usize,
            running: is_running.clone(),
            overflow: overflow_counter.clone(),
            failed: failed.clone(),
        };

        let stream = match sample_format {
            SampleFormat::F32 => build_input::<f32>(device, config, producer, taps, |s| s),
            SampleFormat::I16 => {
                build_input::<i16>(device, config, producer, taps, |s| s as f32 / 32768.0)
            }
            SampleFormat::U16 => build_input::<u16>(device, config, producer, taps, |s| {
                (s as f32 - 32768.0) / 32768.0
            }),
            SampleFormat::U8 => {
                build_input::<u8>(device, config, producer, taps, |s| (s as f32 - 128.0) / 128.0)
            }
            _ => anyhow::bail!("Unsupported sample format: {:?}", sample_format),
        }
        .context("Failed to build input stream")?;

        Ok(Self {
            stream,
            sample_rate,
            overflow_counter,
            is_running,
            failed,
        })
    }

    pub fn start(&self) -> Result<()> {
        self.is_running.store(true, Ordering::SeqCst);
        self.stream.play().context("Failed to start audio stream")?;
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.is_running.store(false, Ordering::SeqCst);
        self.stream.pause().context("Failed to stop audio stream")?;
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_counter.load(Ordering::Relaxed)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Shared flags the cpal callbacks report through
struct StreamTaps {
    channels: usize,
    running: Arc<AtomicBool>,
    overflow: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    mut producer: HeapProd<f32>,
    taps: StreamTaps,
    convert: fn(T) -> f32,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + Send + 'static,
{
    let StreamTaps {
        channels,
        running,
        overflow,
        failed,
    } = taps;

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            push_first_channel(data, channels, &mut producer, &overflow, convert);
        },
        move |err| {
            error!("Audio stream error: {}", err);
            failed.store(true, Ordering::Relaxed);
        },
        None,
    )
}

fn push_first_channel<T: Copy>(
    data: &[T],
    channels: usize,
    producer: &mut HeapProd<f32>,
    overflow_counter: &AtomicU64,
    convert: fn(T) -> f32,
) {
    for frame in data.chunks(channels.max(1)) {
        if producer.try_push(convert(frame[0])).is_err() {
            overflow_counter.fetch_add(1, Ordering::Relaxed);
            break;
        }
    }
}
