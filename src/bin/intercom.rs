//! Intercom console application
//!
//! Brings up the audio links and the control channel, then takes simple
//! commands on stdin: control lines are forwarded to the remote peer,
//! `play` pushes a test tone at it.

use anyhow::Result;
use std::io::{self, BufRead};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_audio_intercom::clip::{FileClip, ToneClip};
use lan_audio_intercom::config::AppConfig;
use lan_audio_intercom::device::AlwaysAllow;
use lan_audio_intercom::session::SessionController;

#[cfg(feature = "hardware")]
use lan_audio_intercom::device::hardware::HardwareProvider;
#[cfg(not(feature = "hardware"))]
use lan_audio_intercom::device::mock::MockProvider;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LAN Audio Intercom");

    let mut config = AppConfig::load()?;

    // Optional positional overrides: <mic-host> [speaker-host]
    let mut args = std::env::args().skip(1);
    if let Some(host) = args.next() {
        config.remote.mic_host = host.clone();
        config.remote.speaker_host = host;
    }
    if let Some(host) = args.next() {
        config.remote.speaker_host = host;
    }

    tracing::info!(
        mic = %config.inbound_endpoint(),
        speaker = %config.outbound_endpoint(),
        control = %config.control_endpoint(),
        "remote endpoints"
    );

    #[cfg(feature = "hardware")]
    let provider = Box::new(HardwareProvider::new());
    #[cfg(not(feature = "hardware"))]
    let provider = {
        tracing::warn!("built without the hardware feature, using synthetic devices");
        Box::new(MockProvider::new())
    };

    let controller = Arc::new(SessionController::new(
        config,
        provider,
        Arc::new(AlwaysAllow),
    ));

    // Print status events as they arrive.
    let events = controller.subscribe();
    std::thread::Builder::new()
        .name("status-print".to_string())
        .spawn(move || {
            for event in events.iter() {
                println!("[{}] {}", event.link, event.status);
            }
        })?;

    controller.start()?;
    print_help();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let input = line.trim();
        match input {
            "" => continue,
            "quit" | "exit" => break,
            "help" => print_help(),
            "start" => {
                if let Err(e) = controller.start() {
                    tracing::error!(error = %e, "start failed");
                }
            }
            "stop" => controller.stop(),
            "play" => {
                controller.request_clip_playback(Box::new(ToneClip::new(880.0, 1500)));
            }
            other => {
                if let Some(path) = other.strip_prefix("play ") {
                    controller.request_clip_playback(Box::new(FileClip::new(path.trim())));
                } else if other.contains('=') {
                    controller.send_command(other);
                } else {
                    println!("unknown command: {} (try help)", other);
                }
            }
        }
    }

    controller.stop();
    Ok(())
}

fn print_help() {
    println!("commands:");
    println!("  start            bring the session up");
    println!("  stop             take the session down");
    println!("  play             play a test tone to the remote speaker");
    println!("  play <path>      play a raw 16-bit LE mono PCM file");
    println!("  KEY=VALUE        send a control command (e.g. S1=127)");
    println!("  quit             stop and exit");
}
