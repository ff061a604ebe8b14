//! Runtime helpers behind the `deck` binary: device listing and playlist playback.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, select};
use deck_player::decoder::DecoderRegistry;
use deck_player::device::{self, CpalOutput};
use deck_player::output::{NullOutput, OutputBackend};
use deck_player::sink::AudioSink;
use deck_player::PlaybackOrchestrator;
use deck_types::{ItemStatus, PlayerEvent};

use crate::config::PlayConfig;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    for (i, d) in device::list_devices(&host)?.iter().enumerate() {
        let marker = if d.is_default { " (default)" } else { "" };
        println!(
            "#{i}: {}{marker} [{}-{} Hz, up to {} ch]",
            d.name, d.min_rate, d.max_rate, d.max_channels
        );
    }
    Ok(())
}

/// Play every input in order. Returns once the list is done or Ctrl-C was pressed.
pub fn run_play(config: PlayConfig, install_ctrlc: bool) -> Result<()> {
    let backend: Box<dyn OutputBackend> = if config.null_output {
        tracing::info!("using null output");
        Box::new(NullOutput::default())
    } else {
        Box::new(CpalOutput::new(normalize_device_name(config.device.clone())))
    };
    let sink = Arc::new(AudioSink::new(backend));
    if let Some(volume) = config.volume {
        sink.set_volume(volume);
    }

    let mut orchestrator =
        PlaybackOrchestrator::new(sink, DecoderRegistry::with_defaults(), config.player.clone())
            .context("start decode thread")?;

    let (interrupt_tx, interrupt_rx) = crossbeam_channel::bounded(1);
    if install_ctrlc {
        ctrlc::set_handler(move || {
            let _ = interrupt_tx.try_send(());
        })
        .context("install Ctrl-C handler")?;
    }

    for input in &config.inputs {
        orchestrator.play_file(input.clone());
        if !wait_for_track(&orchestrator, &interrupt_rx) {
            tracing::info!("interrupted");
            break;
        }
    }
    orchestrator.shutdown();
    Ok(())
}

/// Follow events until the current track ends. `false` when interrupted.
fn wait_for_track(orchestrator: &PlaybackOrchestrator, interrupt: &Receiver<()>) -> bool {
    let events = orchestrator.events().receiver();
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(PlayerEvent::PlaybackStateChanged(
                    status @ (ItemStatus::Finished | ItemStatus::Stopped),
                )) => {
                    tracing::debug!(?status, "track done");
                    return true;
                }
                Ok(PlayerEvent::TrackInfoChanged) => log_now_playing(orchestrator),
                Ok(PlayerEvent::Error(kind)) => tracing::warn!(?kind, "playback error"),
                Ok(PlayerEvent::BufferingStarted) => tracing::info!("buffering"),
                Ok(PlayerEvent::BufferingFailed) => tracing::warn!("buffering failed"),
                Ok(_) => {}
                Err(_) => return true,
            },
            recv(interrupt) -> _ => return false,
            default(PROGRESS_INTERVAL) => {
                let status = orchestrator.status();
                tracing::info!(
                    elapsed_ms = status.elapsed_ms,
                    duration_ms = status.duration_ms.unwrap_or(0),
                    buffered_bytes = status.buffered_bytes,
                    underruns = status.underrun_events,
                    "progress"
                );
            }
        }
    }
}

fn log_now_playing(orchestrator: &PlaybackOrchestrator) {
    let info = orchestrator.track_info();
    let Ok(ti) = info.lock() else {
        return;
    };
    // Cleared between tracks.
    if !ti.file_name.is_empty() {
        tracing::info!(title = %ti.full_title(), "now playing");
    }
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use deck_player::PlayerConfig;

    #[test]
    fn normalize_device_name_drops_blank() {
        assert_eq!(normalize_device_name(Some("  ".to_string())), None);
        assert_eq!(
            normalize_device_name(Some(" USB DAC ".to_string())),
            Some("USB DAC".to_string())
        );
        assert_eq!(normalize_device_name(None), None);
    }

    #[test]
    fn run_play_skips_unplayable_inputs_headless() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.flac");
        let config = PlayConfig {
            inputs: vec![missing.to_string_lossy().into_owned()],
            device: None,
            volume: Some(5),
            null_output: true,
            player: PlayerConfig::default(),
        };
        run_play(config, false).unwrap();
    }
}
