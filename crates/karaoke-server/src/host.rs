//! `karaoke host`: receive every guest mic in the room and play the mix.

use karaoke_common::config::AppConfig;
use karaoke_mic::MicConfig;
use karaoke_mic::device::Playback;
use karaoke_mic::panel::{MicPanel, Mixer, PanelCommand, PanelSnapshot};
use karaoke_mic::receiver::MicReceiver;
use karaoke_mic::rtc::RtcPeerFactory;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};

const HELP: &str = "commands: e (enable audio), m (mute/unmute), v <0-1> (volume), \
                    fx on|off, fx <0-1> (effect intensity), q (quit)";

pub async fn run(config: &AppConfig, relay: &str, room: &str) -> anyhow::Result<()> {
    let mic_config = MicConfig::from(config);
    let factory = Arc::new(RtcPeerFactory::new(mic_config.ice_servers.clone())?);
    let (socket, inbound) = karaoke_mic::room::connect(relay, room).await?;

    let receiver = MicReceiver::new(factory, Arc::new(socket));
    let handle = receiver.handle();
    let panel = MicPanel::new(mic_config.clone(), Arc::new(handle.clone()));
    let mixer = panel.mixer();

    let (panel_tx, panel_rx) = mpsc::channel::<PanelCommand>(32);
    let receiver_task = tokio::spawn(receiver.run(inbound));
    let panel_task = tokio::spawn(panel.run(handle.sources(), panel_rx));

    tracing::info!(%room, "Hosting. {HELP}");

    let mut playback: Option<Playback> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut report = tokio::time::interval(mic_config.stats_interval);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                match parse_command(&line) {
                    Some(HostInput::Quit) => break,
                    Some(HostInput::Enable) => {
                        playback = None;
                        match start_playback(mixer.clone(), panel_tx.clone()).await {
                            Ok(started) => {
                                playback = Some(started);
                                let _ = panel_tx.send(PanelCommand::EnableAudio).await;
                            }
                            Err(e) => tracing::warn!(error = %e, "Could not start playback"),
                        }
                    }
                    Some(HostInput::Panel(command)) => {
                        let _ = panel_tx.send(command).await;
                    }
                    None => println!("{HELP}"),
                }
            }
            _ = report.tick() => {
                if let Some(snapshot) = snapshot(&panel_tx).await {
                    log_snapshot(&snapshot);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(playback);
    handle.shutdown();
    drop(panel_tx);
    let _ = receiver_task.await;
    let _ = panel_task.await;
    Ok(())
}

#[derive(Debug)]
enum HostInput {
    Enable,
    Quit,
    Panel(PanelCommand),
}

fn parse_command(line: &str) -> Option<HostInput> {
    let mut words = line.split_whitespace();
    let input = match (words.next()?, words.next()) {
        ("e", None) => HostInput::Enable,
        ("q", None) => HostInput::Quit,
        ("m", None) => HostInput::Panel(PanelCommand::ToggleMute),
        ("v", Some(volume)) => HostInput::Panel(PanelCommand::SetVolume(volume.parse().ok()?)),
        ("fx", Some("on")) => HostInput::Panel(PanelCommand::SetEffectEnabled(true)),
        ("fx", Some("off")) => HostInput::Panel(PanelCommand::SetEffectEnabled(false)),
        ("fx", Some(intensity)) => {
            HostInput::Panel(PanelCommand::SetEffectIntensity(intensity.parse().ok()?))
        }
        _ => return None,
    };
    Some(input)
}

async fn start_playback(
    mixer: Mixer,
    panel_tx: mpsc::Sender<PanelCommand>,
) -> anyhow::Result<Playback> {
    let on_error = Arc::new(move |message: String| {
        tracing::warn!(error = %message, "Playback failed");
        let _ = panel_tx.try_send(PanelCommand::PlaybackFailed);
    });
    let playback = tokio::task::spawn_blocking(move || Playback::start(mixer, on_error)).await??;
    Ok(playback)
}

async fn snapshot(panel_tx: &mpsc::Sender<PanelCommand>) -> Option<PanelSnapshot> {
    let (reply, rx) = oneshot::channel();
    panel_tx.send(PanelCommand::Snapshot(reply)).await.ok()?;
    rx.await.ok()
}

fn log_snapshot(snapshot: &PanelSnapshot) {
    if snapshot.needs_enable_prompt {
        tracing::info!("{}  (press e + Enter to enable audio)", snapshot.header);
    } else {
        tracing::info!(
            muted = snapshot.settings.muted,
            volume = snapshot.settings.volume,
            effect = snapshot.settings.effect_enabled,
            "{}",
            snapshot.header
        );
    }
    for row in &snapshot.rows {
        tracing::info!("  {row}");
    }
}
