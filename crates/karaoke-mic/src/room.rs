//! Room relay client over WebSocket.
//!
//! Connects to `{base}/parties/main/{room}`, encodes outgoing [`MicSignal`]s as JSON
//! text frames, and forwards inbound mic signals to a channel. Other room traffic is
//! dropped here.

use crate::error::SignalError;
use crate::protocol::MicSignal;
use crate::transport::SignalingChannel;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Relay URL for a room.
pub fn room_url(base: &str, room: &str) -> String {
    format!("{}/parties/main/{}", base.trim_end_matches('/'), room)
}

/// Outbound half of a room connection.
#[derive(Clone)]
pub struct RoomSocket {
    outbound: mpsc::UnboundedSender<String>,
}

impl SignalingChannel for RoomSocket {
    fn send(&self, signal: &MicSignal) -> Result<(), SignalError> {
        let text = serde_json::to_string(signal)?;
        self.outbound.send(text).map_err(|_| SignalError::Closed)
    }
}

/// Decode one text frame. Returns `None` for anything that is not a mic signal.
pub fn decode_signal(text: &str) -> Option<MicSignal> {
    match serde_json::from_str::<MicSignal>(text) {
        Ok(MicSignal::Other) => None,
        Ok(signal) => Some(signal),
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring undecodable room message");
            None
        }
    }
}

/// Join a room. The returned receiver yields inbound mic signals and closes when the
/// connection does.
pub async fn connect(
    base_url: &str,
    room: &str,
) -> Result<(RoomSocket, mpsc::UnboundedReceiver<MicSignal>), SignalError> {
    let url = room_url(base_url, room);
    let (ws, _) = connect_async(url.as_str()).await?;
    tracing::info!(%url, "Joined room");

    let (mut write, mut read) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<MicSignal>();

    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = write.send(Message::Text(text.into())).await {
                tracing::warn!(error = %e, "Room send failed");
                break;
            }
        }
        let _ = write.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if let Some(signal) = decode_signal(text.as_str()) {
                        if in_tx.send(signal).is_err() {
                            break;
                        }
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Room connection error");
                    break;
                }
            }
        }
        tracing::info!("Left room");
    });

    Ok((RoomSocket { outbound: out_tx }, in_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_url() {
        assert_eq!(
            room_url("ws://127.0.0.1:1999/", "party-1"),
            "ws://127.0.0.1:1999/parties/main/party-1"
        );
    }

    #[test]
    fn test_decode_filters_room_traffic() {
        assert!(decode_signal(r#"{"type":"chat","text":"hi"}"#).is_none());
        assert!(decode_signal("not json").is_none());
        assert!(matches!(
            decode_signal(r#"{"type":"mic:offer","from":"a","payload":{"type":"offer","sdp":"v=0"}}"#),
            Some(MicSignal::Offer { .. })
        ));
    }

    #[test]
    fn test_send_after_close_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = RoomSocket { outbound: tx };
        drop(rx);
        assert!(matches!(
            socket.send(&MicSignal::Other),
            Err(SignalError::Closed)
        ));
    }
}
