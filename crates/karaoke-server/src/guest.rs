//! `karaoke guest`: stream the local microphone to the room's host.

use karaoke_common::config::AppConfig;
use karaoke_mic::MicConfig;
use karaoke_mic::device::CpalCapture;
use karaoke_mic::rtc::RtcPeerFactory;
use karaoke_mic::sender::{MicSender, SenderCommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

pub async fn run(config: &AppConfig, relay: &str, room: &str) -> anyhow::Result<()> {
    let mic_config = MicConfig::from(config);
    let factory = Arc::new(RtcPeerFactory::new(mic_config.ice_servers.clone())?);
    let capture = Arc::new(CpalCapture::new(mic_config.noise_suppression));
    let (socket, inbound) = karaoke_mic::room::connect(relay, room).await?;

    let sender = MicSender::new(factory, capture, Arc::new(socket));
    let mut state = sender.subscribe();
    let (commands_tx, commands_rx) = mpsc::channel::<SenderCommand>(8);
    let sender_task = tokio::spawn(sender.run(inbound, commands_rx));

    tracing::info!(%room, "Joined as guest. Press Enter to toggle the mic, Ctrl-C to leave");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(_)) = line else { break };
                if commands_tx.send(SenderCommand::Toggle).await.is_err() {
                    break;
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                tracing::info!(
                    mic_on = current.mic_on,
                    connected = current.connected,
                    "{}",
                    if current.mic_on { "Mic on" } else { "Mic off" }
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // Closing the command channel stops the sender and releases the device.
    drop(commands_tx);
    let _ = sender_task.await;
    Ok(())
}
