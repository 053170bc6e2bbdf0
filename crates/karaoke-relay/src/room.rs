//! Room registry: which connections are in which party room.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

/// Outbound queue of a single WebSocket connection.
pub type ConnectionTx = mpsc::UnboundedSender<String>;

struct Member {
    tx: ConnectionTx,
    joined_at: DateTime<Utc>,
}

struct RelayRoom {
    members: HashMap<String, Member>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub room: String,
    pub connections: usize,
    pub created_at: DateTime<Utc>,
    pub oldest_member_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub active_rooms: usize,
    pub total_connections: usize,
}

/// Where a message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Every member except the origin.
    Broadcast,
    /// One member only.
    To(String),
}

/// All rooms, keyed by room id. Rooms exist while they have members.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, RelayRoom>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection unless the room already holds `max_members`. Creates the
    /// room if needed. Check and insert happen under one write lock.
    pub async fn try_join(
        &self,
        room: &str,
        conn_id: String,
        tx: ConnectionTx,
        max_members: usize,
    ) -> bool {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room).is_some_and(|entry| entry.members.len() >= max_members) {
            return false;
        }
        let entry = rooms.entry(room.to_string()).or_insert_with(|| {
            tracing::info!(room, "Room created");
            RelayRoom {
                members: HashMap::new(),
                created_at: Utc::now(),
            }
        });
        entry.members.insert(
            conn_id,
            Member {
                tx,
                joined_at: Utc::now(),
            },
        );
        true
    }

    /// Remove a connection, dropping the room once it is empty.
    pub async fn leave(&self, room: &str, conn_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(entry) = rooms.get_mut(room) {
            entry.members.remove(conn_id);
            if entry.members.is_empty() {
                rooms.remove(room);
                tracing::info!(room, "Room closed");
            }
        }
    }

    /// Deliver `text` from `from`. Returns how many members it was queued for.
    pub async fn deliver(&self, room: &str, from: &str, route: &Route, text: &str) -> usize {
        let rooms = self.rooms.read().await;
        let Some(entry) = rooms.get(room) else {
            return 0;
        };

        match route {
            Route::To(target) => match entry.members.get(target) {
                Some(member) if target != from => usize::from(member.tx.send(text.to_string()).is_ok()),
                _ => {
                    tracing::debug!(room, %target, "Dropping message for absent member");
                    0
                }
            },
            Route::Broadcast => entry
                .members
                .iter()
                .filter(|(id, _)| id.as_str() != from)
                .filter(|(_, member)| member.tx.send(text.to_string()).is_ok())
                .count(),
        }
    }

    pub async fn connection_count(&self, room: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room)
            .map_or(0, |entry| entry.members.len())
    }

    pub async fn room_stats(&self, room: &str) -> Option<RoomStats> {
        let rooms = self.rooms.read().await;
        rooms.get(room).map(|entry| RoomStats {
            room: room.to_string(),
            connections: entry.members.len(),
            created_at: entry.created_at,
            oldest_member_since: entry.members.values().map(|m| m.joined_at).min(),
        })
    }

    pub async fn stats(&self) -> RelayStats {
        let rooms = self.rooms.read().await;
        RelayStats {
            active_rooms: rooms.len(),
            total_connections: rooms.values().map(|r| r.members.len()).sum(),
        }
    }
}
