//! # karaoke-relay
//!
//! Signaling relay for karaoke parties. Every party has a room; every socket in
//! a room sees what the others send:
//! - Messages are JSON objects, stamped with the sender's connection id as `from`
//! - A `target` field narrows delivery to a single connection
//! - Everything else is broadcast to the rest of the room
//!
//! The relay never looks past `from`/`target`, so mic signaling and playlist
//! traffic share the same socket.

pub mod room;

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use karaoke_common::error::{KaraokeError, KaraokeResult};
use karaoke_common::{id, validation};
use room::{RelayStats, RoomRegistry, RoomStats, Route};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

/// Relay state shared by every handler.
#[derive(Clone)]
pub struct RelayState {
    pub rooms: RoomRegistry,
    pub max_room_size: usize,
}

impl RelayState {
    pub fn new(max_room_size: usize) -> Self {
        Self {
            rooms: RoomRegistry::new(),
            max_room_size,
        }
    }
}

/// Build the relay router.
pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/parties/main/{room}", get(ws_handler))
        .route("/rooms/{room}", get(room_stats))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    #[serde(flatten)]
    stats: RelayStats,
}

async fn health(State(state): State<Arc<RelayState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        stats: state.rooms.stats().await,
    })
}

async fn room_stats(
    Path(room): Path<String>,
    State(state): State<Arc<RelayState>>,
) -> KaraokeResult<Json<RoomStats>> {
    state
        .rooms
        .room_stats(&room)
        .await
        .map(Json)
        .ok_or_else(|| KaraokeError::NotFound {
            resource: format!("Room {room}"),
        })
}

/// WebSocket upgrade handler. Rejects bad room ids and full rooms before upgrading.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room): Path<String>,
    State(state): State<Arc<RelayState>>,
) -> KaraokeResult<Response> {
    validation::validate_room_id(&room)?;

    if state.rooms.connection_count(&room).await >= state.max_room_size {
        tracing::warn!(%room, max = state.max_room_size, "Room full, rejecting connection");
        return Err(KaraokeError::LimitReached {
            message: format!("Room {room} is full"),
        });
    }

    Ok(ws.on_upgrade(move |socket| handle_connection(socket, room, state)))
}

/// Stamp `from` onto an inbound frame and work out where it goes.
///
/// Returns `None` for anything that is not a JSON object.
pub fn stamp(text: &str, conn_id: &str) -> Option<(String, Route)> {
    let mut value: serde_json::Value = serde_json::from_str(text).ok()?;
    let object = value.as_object_mut()?;

    object.insert("from".into(), serde_json::Value::String(conn_id.to_string()));
    let route = match object.get("target").and_then(|t| t.as_str()) {
        Some(target) => Route::To(target.to_string()),
        None => Route::Broadcast,
    };

    Some((value.to_string(), route))
}

/// Handle a single WebSocket connection.
async fn handle_connection(mut socket: WebSocket, room: String, state: Arc<RelayState>) {
    let conn_id = id::generate_id().to_string();

    // Single writer per socket keeps delivery order per origin.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if !state
        .rooms
        .try_join(&room, conn_id.clone(), tx, state.max_room_size)
        .await
    {
        tracing::warn!(%room, max = state.max_room_size, "Room filled during upgrade, closing");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "Room is full".into(),
            })))
            .await;
        return;
    }

    let (mut sender, mut receiver) = socket.split();
    tracing::info!(%room, conn = %conn_id, "Connection joined room");

    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let Some((stamped, route)) = stamp(text.as_str(), &conn_id) else {
                    tracing::debug!(%room, conn = %conn_id, "Dropping non-object frame");
                    continue;
                };
                let delivered = state.rooms.deliver(&room, &conn_id, &route, &stamped).await;
                tracing::trace!(%room, conn = %conn_id, delivered, "Relayed message");
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.rooms.leave(&room, &conn_id).await;
    send_task.abort();
    tracing::info!(%room, conn = %conn_id, "Connection left room");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_broadcast() {
        let (text, route) = stamp(r#"{"type":"mic:offer","payload":{}}"#, "abc").unwrap();
        assert_eq!(route, Route::Broadcast);
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["from"], "abc");
        assert_eq!(value["type"], "mic:offer");
    }

    #[test]
    fn test_stamp_overwrites_forged_from() {
        let (text, _) = stamp(r#"{"type":"x","from":"someone-else"}"#, "abc").unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["from"], "abc");
    }

    #[test]
    fn test_stamp_targeted() {
        let (_, route) = stamp(r#"{"type":"mic:answer","target":"xyz"}"#, "abc").unwrap();
        assert_eq!(route, Route::To("xyz".into()));
    }

    #[test]
    fn test_stamp_rejects_non_objects() {
        assert!(stamp("not json", "abc").is_none());
        assert!(stamp("[1,2,3]", "abc").is_none());
        assert!(stamp("\"hello\"", "abc").is_none());
    }
}
