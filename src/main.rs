//! D-mon Live - voice companion over Gemini Live
//!
//! Connects to the Live API, opens the audio devices and runs one session
//! until the link drops or the user quits. Type `m` to toggle mute, `v` / `s`
//! to start / stop visual streaming, `c` to clear the companion's memory and
//! `q` to disconnect.
//!
//! Audio goes through PulseAudio. Builds without the `pulse` feature, or runs
//! with `DMON_AUDIO=sim`, use the simulated devices instead.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use dmon_live::events::TranscriptEvent;
use dmon_live::device::AudioBackend;
#[cfg(feature = "pulse")]
use dmon_live::pulse::PulseBackend;
use dmon_live::session::SessionOutputs;
use dmon_live::sim::SimBackend;
use dmon_live::transport::GeminiTransport;
use dmon_live::visual::StillFrame;
use dmon_live::{CompanionConfig, Session, SessionCommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting D-mon Live");

    let config = CompanionConfig::from_env().context("invalid DMON_* configuration")?;
    info!(
        "Persona {:?}, language {:?}, voice {}",
        config.persona, config.language, config.voice
    );

    let (outbound, inbound) = GeminiTransport::connect(&config)
        .await
        .context("failed to open the Gemini Live link")?;

    let backend = audio_backend(&config);
    let (session, outputs) = Session::new(config, Arc::new(outbound));
    let mut session = match std::env::var("DMON_STILL_FRAME") {
        Ok(path) => {
            let jpeg = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read still frame {}", path))?;
            session.with_frames(Arc::new(StillFrame::new(jpeg)))
        }
        Err(_) => session,
    };
    spawn_reporters(outputs);

    session
        .open(backend.as_ref())
        .context("failed to open audio devices")?;

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    spawn_keyboard(command_tx.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            let _ = command_tx.send(SessionCommand::Disconnect);
        }
    });

    session.run(inbound, command_rx).await;
    info!("D-mon Live stopped");
    Ok(())
}

fn audio_backend(config: &CompanionConfig) -> Box<dyn AudioBackend> {
    let simulated = std::env::var("DMON_AUDIO").is_ok_and(|v| v == "sim");
    #[cfg(feature = "pulse")]
    if !simulated {
        info!("Using PulseAudio devices");
        return Box::new(
            PulseBackend::new("D-mon Live")
                .with_devices(config.input_device.clone(), config.output_device.clone()),
        );
    }
    let _ = (config, simulated);
    info!("Using simulated audio devices");
    Box::new(SimBackend::default())
}

fn spawn_reporters(outputs: SessionOutputs) {
    let SessionOutputs {
        mut notices,
        mut transcript,
        mut loudness,
    } = outputs;

    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            info!("{}", notice);
        }
    });

    tokio::spawn(async move {
        while let Some(event) = transcript.recv().await {
            match event {
                TranscriptEvent::Model(text) => info!("AI: {}", text),
                TranscriptEvent::User(text) => info!("You: {}", text),
                TranscriptEvent::TurnComplete => debug!("Turn complete"),
                TranscriptEvent::Cleared => info!("Transcript cleared"),
            }
        }
    });

    tokio::spawn(async move {
        while loudness.changed().await.is_ok() {
            let level = *loudness.borrow_and_update();
            trace!("Loudness ai={:.2} user={:.2}", level.ai, level.user);
        }
    });
}

fn spawn_keyboard(commands: mpsc::UnboundedSender<SessionCommand>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            };
            let command = match line.trim() {
                "m" => SessionCommand::ToggleMute,
                "v" => SessionCommand::StartVisual,
                "s" => SessionCommand::StopVisual,
                "c" => SessionCommand::ClearMemory,
                "q" => SessionCommand::Disconnect,
                "" => continue,
                other => {
                    info!("Unknown command {:?} (m, v, s, c, q)", other);
                    continue;
                }
            };
            if commands.send(command).is_err() {
                break;
            }
        }
    });
}
