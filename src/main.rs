use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{error, info};

use voice_gate::audio::{list_input_devices, CpalMicrophone};
use voice_gate::logging::{init_logging, log_call_summary};
use voice_gate::{
    AudioSender, CallCommand, CallEvent, CallRuntime, Config, DispatchGate, EventBus,
    FailureTracker, HttpUploadSender, Notice, VoiceSession, WavDirectorySender,
};

/// Hands-free voice capture: detects utterances on the microphone and sends each one as a WAV clip
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to ~/.voicegate/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input device ID (use "default" or run with --list-devices)
    #[arg(short, long)]
    device: Option<String>,

    /// List available input devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Directory utterances are written to when no upload URL is given
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Upload each utterance to this URL instead of writing files
    #[arg(short, long)]
    upload_url: Option<String>,

    /// Start with the microphone muted
    #[arg(long)]
    start_muted: bool,

    /// Analyzer tick period (ms)
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Give up on a send after this long (ms)
    #[arg(long)]
    dispatch_timeout_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(device) = &self.device {
            config.input_device_id = (device != "default").then(|| device.clone());
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = Some(dir.clone());
        }
        if let Some(url) = &self.upload_url {
            config.upload_url = Some(url.clone());
        }
        if self.start_muted {
            config.start_muted = true;
        }
        if let Some(tick_ms) = self.tick_ms {
            config.tick_ms = tick_ms;
        }
        if let Some(timeout) = self.dispatch_timeout_ms {
            config.dispatch.timeout_ms = timeout;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.list_devices {
        return list_devices_and_exit();
    }

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => Config::default_config_path()?,
    };
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    args.apply(&mut config);

    let sender: Arc<dyn AudioSender> = match &config.upload_url {
        Some(url) => {
            info!("Uploading utterances to {}", url);
            Arc::new(HttpUploadSender::new(url.clone()))
        }
        None => {
            let dir = config.resolved_output_dir()?;
            info!("Writing utterances to {}", dir.display());
            Arc::new(WavDirectorySender::new(dir))
        }
    };

    let events = EventBus::new();
    let failures = FailureTracker::new(config.dispatch.failure_notice_threshold, events.clone());
    let microphone = CpalMicrophone::new(config.input_device_id.clone());
    let session = VoiceSession::new(
        config.clone(),
        Box::new(microphone),
        events.clone(),
        failures.clone(),
    );
    let gate = DispatchGate::new(sender, &config.dispatch, events.clone(), failures);
    let runtime = CallRuntime::new(session, gate, config.tick_ms);

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(print_events(events.subscribe()));
    tokio::spawn(read_commands(tx.clone()));
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, stopping...");
        tx.send(CallCommand::Close).ok();
    });

    println!("\nListening... [m] mute, [enter]/[f] send now, [p] pause, [q] quit\n");

    let summary = runtime.run(rx).await.context("Voice session ended")?;

    log_call_summary(&summary);
    println!("\n--- Call Summary ---");
    println!("Utterances: {}", summary.session.utterances);
    println!("Speech: {:.1}s", summary.session.speech_ms as f64 / 1000.0);
    println!("Sent: {}", summary.dispatch.sent);
    println!("Failed: {}", summary.dispatch.failed);
    if summary.dispatch.dropped > 0 {
        println!("Dropped while busy: {}", summary.dispatch.dropped);
    }
    Ok(())
}

async fn read_commands(tx: UnboundedSender<CallCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let command = match line.trim() {
            "" | "f" => CallCommand::Flush,
            "m" => CallCommand::ToggleMute,
            "p" => CallCommand::TogglePause,
            "q" => CallCommand::Close,
            other => {
                println!("Unknown command: {}", other);
                continue;
            }
        };
        if tx.send(command).is_err() {
            break;
        }
    }
}

async fn print_events(mut rx: UnboundedReceiver<CallEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            CallEvent::MuteChanged { muted } => {
                println!("{}", if muted { "Muted" } else { "Unmuted" })
            }
            CallEvent::PauseChanged { paused } => {
                println!("{}", if paused { "Paused" } else { "Resumed" })
            }
            CallEvent::Calibrated { ambient_noise } => {
                println!("Ambient noise: {:.4}", ambient_noise)
            }
            CallEvent::SpeechStarted => println!("Speaking..."),
            CallEvent::SpeechEnded { speaking_ms } => {
                println!("Utterance ended ({:.1}s)", speaking_ms as f64 / 1000.0)
            }
            CallEvent::DispatchFinished { ok: false, .. } => println!("Send failed"),
            CallEvent::Notice(Notice::MicrophoneUnavailable { message }) => println!("{}", message),
            CallEvent::Notice(Notice::RepeatedFailures { count, last_error }) => {
                println!("{} failures in a row, last: {}", count, last_error)
            }
            CallEvent::Closed => break,
            _ => {}
        }
    }
}

fn list_devices_and_exit() -> Result<()> {
    println!("Available input devices:\n");

    match list_input_devices() {
        Ok(devices) => {
            if devices.is_empty() {
                println!("  No input devices found.");
            } else {
                for device in devices {
                    let default_marker = if device.is_default { " (default)" } else { "" };
                    println!("  - {}{}", device.name, default_marker);
                }
            }
        }
        Err(e) => {
            error!("Failed to list devices: {}", e);
            println!("  Error: {}", e);
        }
    }

    Ok(())
}
