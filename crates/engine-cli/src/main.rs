//! enginectl: drive the audio engine from the command line.
//!
//! - `list-devices`: print output devices with their sample-rate ranges.
//! - `play`: play one URI to completion, printing player events as JSON lines.
//! - `serve`: a line-oriented JSON front end. Each stdin line is a method call
//!   (`{"seq":1,"method":"load","args":{...}}`); responses, `event` and `data`
//!   messages are written to stdout, one per line.

mod cli;

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use audio_engine::dispatch::{event_message, handle_line};
use audio_engine::notify::{ChannelListener, PlayerEvent};
use audio_engine::{EngineConfig, PlayerRegistry, device};
use audio_engine_types::{OutboundMessage, ProcessingState};
use clap::Parser;
use crossbeam_channel::{Receiver, select};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,audio_engine=info,enginectl=info")
        }))
        .init();

    let config = args.engine_config()?;

    let (interrupt_tx, interrupt_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })
    .context("install ctrl-c handler")?;

    match &args.cmd {
        cli::Command::ListDevices => list_devices(),
        cli::Command::Play {
            uri,
            volume,
            seek_ms,
        } => play(config, uri, *volume, *seek_ms, interrupt_rx),
        cli::Command::Serve => serve(config, interrupt_rx),
    }
}

fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    for info in device::list_device_infos(&host)? {
        let marker = if info.is_default { "*" } else { " " };
        println!(
            "{marker} {} ({}-{} Hz)",
            info.name, info.min_rate, info.max_rate
        );
    }
    Ok(())
}

fn play(
    config: EngineConfig,
    uri: &str,
    volume: f64,
    seek_ms: Option<u64>,
    interrupt: Receiver<()>,
) -> Result<()> {
    let (listener, events) = ChannelListener::unbounded();
    let mut registry = PlayerRegistry::with_default_output(config, listener);
    {
        let player = registry.init("cli")?;
        player.set_volume(volume);
        let duration = player.load(uri)?;
        tracing::info!(uri, duration_us = duration, "loaded");
        if let Some(ms) = seek_ms {
            let micros = i64::try_from(ms.saturating_mul(1000)).unwrap_or(i64::MAX);
            player.seek(micros)?;
        }
        player.play()?;
    }

    let mut out = std::io::stdout().lock();
    loop {
        select! {
            recv(events) -> msg => {
                let Ok((id, event)) = msg else { break };
                write_message(&mut out, &event_message(&id, &event))?;
                if let PlayerEvent::Progress(progress) = event {
                    if progress.processing_state == ProcessingState::Completed {
                        tracing::info!("playback completed");
                        break;
                    }
                }
            }
            recv(interrupt) -> _ => {
                tracing::info!("interrupted");
                break;
            }
        }
    }
    registry.dispose_all_players();
    Ok(())
}

fn serve(config: EngineConfig, interrupt: Receiver<()>) -> Result<()> {
    let (listener, events) = ChannelListener::unbounded();
    let mut registry = PlayerRegistry::with_default_output(config, listener);

    let (line_tx, lines) = crossbeam_channel::unbounded::<String>();
    std::thread::Builder::new()
        .name("stdin-reader".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if line_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
        })
        .context("spawn stdin reader")?;

    tracing::info!(max_players = registry.config().max_players, "serving on stdin/stdout");
    let mut out = std::io::stdout().lock();
    loop {
        select! {
            recv(lines) -> msg => {
                let Ok(line) = msg else {
                    tracing::info!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(&mut registry, &line);
                write_message(&mut out, &response)?;
            }
            recv(events) -> msg => {
                if let Ok((id, event)) = msg {
                    write_message(&mut out, &event_message(&id, &event))?;
                }
            }
            recv(interrupt) -> _ => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    registry.dispose_all_players();
    while let Ok((id, event)) = events.try_recv() {
        write_message(&mut out, &event_message(&id, &event))?;
    }
    Ok(())
}

fn write_message(out: &mut impl Write, msg: &OutboundMessage) -> Result<()> {
    serde_json::to_writer(&mut *out, msg).context("encode message")?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
