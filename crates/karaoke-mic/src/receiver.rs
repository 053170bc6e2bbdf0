//! Host side: accept any number of concurrent mic senders.
//!
//! One [`MicReceiver`] event loop owns the map of [`PeerSession`]s. Room signals,
//! peer events, negotiation results, and controller commands all pass through the same
//! loop, so session state is only ever touched from one place. SDP negotiation itself
//! runs on spawned tasks that report back tagged with the session generation; results
//! for a session that has since been replaced are ignored.
//!
//! ```text
//!  room ──► handle_signal ──┐
//!  peer events ─────────────┼──► sessions ──► live sources (watch) ──► panel
//!  ReceiverHandle ──────────┘
//! ```

use crate::error::MicError;
use crate::media::MediaStream;
use crate::protocol::{IceCandidate, MicSignal, PeerId, SessionDescription};
use crate::session::PeerSession;
use crate::transport::{PeerConnection, PeerEvent, PeerEventSink, PeerFactory, SignalingChannel};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// A sender whose audio track has arrived and is playable.
#[derive(Clone)]
pub struct LiveSource {
    pub sender_id: PeerId,
    pub generation: u64,
    pub stream: MediaStream,
    pub peer: Arc<dyn PeerConnection>,
}

impl std::fmt::Debug for LiveSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSource")
            .field("sender_id", &self.sender_id)
            .field("generation", &self.generation)
            .field("stream", &self.stream.id())
            .finish()
    }
}

/// Something that can tear down the session behind a live source.
pub trait SessionCloser: Send + Sync {
    fn force_close(&self, source: &LiveSource);
}

#[derive(Debug, Clone)]
pub enum ReceiverCommand {
    ForceClose { sender_id: PeerId, generation: u64 },
    Shutdown,
}

enum ReceiverEvent {
    Peer {
        sender_id: PeerId,
        generation: u64,
        event: PeerEvent,
    },
    RemoteApplied {
        sender_id: PeerId,
        generation: u64,
    },
    NegotiationFailed {
        sender_id: PeerId,
        generation: u64,
        error: MicError,
    },
}

/// Cloneable control handle for a running [`MicReceiver`].
#[derive(Clone)]
pub struct ReceiverHandle {
    commands: mpsc::UnboundedSender<ReceiverCommand>,
    sources: watch::Receiver<Vec<LiveSource>>,
}

impl ReceiverHandle {
    pub fn sources(&self) -> watch::Receiver<Vec<LiveSource>> {
        self.sources.clone()
    }

    pub fn live_sources(&self) -> Vec<LiveSource> {
        self.sources.borrow().clone()
    }

    pub fn close_source(&self, sender_id: &str, generation: u64) {
        let _ = self.commands.send(ReceiverCommand::ForceClose {
            sender_id: sender_id.to_string(),
            generation,
        });
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(ReceiverCommand::Shutdown);
    }
}

impl SessionCloser for ReceiverHandle {
    fn force_close(&self, source: &LiveSource) {
        self.close_source(&source.sender_id, source.generation);
    }
}

pub struct MicReceiver {
    factory: Arc<dyn PeerFactory>,
    signaling: Arc<dyn SignalingChannel>,
    sessions: HashMap<PeerId, PeerSession>,
    sources: watch::Sender<Vec<LiveSource>>,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<ReceiverEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ReceiverEvent>>,
    commands_rx: Option<mpsc::UnboundedReceiver<ReceiverCommand>>,
    handle: ReceiverHandle,
}

impl MicReceiver {
    pub fn new(factory: Arc<dyn PeerFactory>, signaling: Arc<dyn SignalingChannel>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (sources, sources_rx) = watch::channel(Vec::new());
        Self {
            factory,
            signaling,
            sessions: HashMap::new(),
            sources,
            next_generation: 0,
            events_tx,
            events_rx: Some(events_rx),
            commands_rx: Some(commands_rx),
            handle: ReceiverHandle {
                commands: commands_tx,
                sources: sources_rx,
            },
        }
    }

    pub fn handle(&self) -> ReceiverHandle {
        self.handle.clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn live_sources(&self) -> Vec<LiveSource> {
        self.sources.borrow().clone()
    }

    pub async fn handle_signal(&mut self, signal: MicSignal) {
        match signal {
            MicSignal::Offer {
                from: Some(sender_id),
                payload,
            } => self.handle_offer(sender_id, payload).await,
            MicSignal::Candidate {
                from: Some(sender_id),
                payload,
                ..
            } => self.handle_candidate(&sender_id, payload),
            MicSignal::Offer { from: None, .. } | MicSignal::Candidate { from: None, .. } => {
                tracing::debug!(kind = signal.kind(), "Dropping mic signal without sender id");
            }
            MicSignal::Answer { .. } | MicSignal::Other => {}
        }
    }

    async fn handle_offer(&mut self, sender_id: PeerId, offer: SessionDescription) {
        if self.sessions.contains_key(&sender_id) {
            self.remove_session(&sender_id, "renegotiated");
        }

        self.next_generation += 1;
        let generation = self.next_generation;

        let tx = self.events_tx.clone();
        let id = sender_id.clone();
        let sink = PeerEventSink::new(move |event| {
            let _ = tx.send(ReceiverEvent::Peer {
                sender_id: id.clone(),
                generation,
                event,
            });
        });

        let peer = match self.factory.create(sink).await {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!(sender = %sender_id, error = %e, "Failed to create peer connection");
                return;
            }
        };

        tracing::info!(sender = %sender_id, generation, "Mic offer received");
        self.sessions.insert(
            sender_id.clone(),
            PeerSession::new(sender_id.clone(), generation, peer.clone()),
        );

        tokio::spawn(answer_offer(
            peer,
            offer,
            sender_id,
            generation,
            self.signaling.clone(),
            self.events_tx.clone(),
        ));
    }

    fn handle_candidate(&mut self, sender_id: &str, candidate: IceCandidate) {
        let Some(session) = self.sessions.get_mut(sender_id) else {
            tracing::debug!(sender = %sender_id, "Candidate for unknown sender");
            return;
        };
        if let Some(candidate) = session.accept_candidate(candidate) {
            tokio::spawn(apply_candidates(
                session.peer(),
                vec![candidate],
                sender_id.to_string(),
            ));
        }
    }

    fn current_session_mut(&mut self, sender_id: &str, generation: u64) -> Option<&mut PeerSession> {
        match self.sessions.get_mut(sender_id) {
            Some(session) if session.generation == generation => Some(session),
            _ => {
                tracing::debug!(sender = %sender_id, generation, "Ignoring event for stale session");
                None
            }
        }
    }

    fn handle_event(&mut self, event: ReceiverEvent) {
        match event {
            ReceiverEvent::RemoteApplied {
                sender_id,
                generation,
            } => {
                let Some(session) = self.current_session_mut(&sender_id, generation) else {
                    return;
                };
                let queued = session.remote_applied();
                if !queued.is_empty() {
                    tokio::spawn(apply_candidates(session.peer(), queued, sender_id));
                }
            }
            ReceiverEvent::NegotiationFailed {
                sender_id,
                generation,
                error,
            } => {
                if self.current_session_mut(&sender_id, generation).is_some() {
                    tracing::warn!(sender = %sender_id, error = %error, "Mic negotiation failed");
                    self.remove_session(&sender_id, "negotiation failed");
                }
            }
            ReceiverEvent::Peer {
                sender_id,
                generation,
                event,
            } => self.handle_peer_event(sender_id, generation, event),
        }
    }

    fn handle_peer_event(&mut self, sender_id: PeerId, generation: u64, event: PeerEvent) {
        let Some(session) = self.current_session_mut(&sender_id, generation) else {
            return;
        };

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let signal = MicSignal::Candidate {
                    from: None,
                    target: Some(sender_id),
                    payload: candidate,
                };
                if let Err(e) = self.signaling.send(&signal) {
                    tracing::warn!(error = %e, "Failed to send ICE candidate");
                }
            }
            PeerEvent::Track(stream) => {
                let peer = session.peer();
                let added = self.sources.send_if_modified(|sources| {
                    if sources.iter().any(|s| s.sender_id == sender_id) {
                        return false;
                    }
                    sources.push(LiveSource {
                        sender_id: sender_id.clone(),
                        generation,
                        stream,
                        peer,
                    });
                    true
                });
                if added {
                    tracing::info!(sender = %sender_id, generation, "Mic is live");
                } else {
                    tracing::debug!(sender = %sender_id, "Duplicate track ignored");
                }
            }
            PeerEvent::ConnectionState(state) => {
                tracing::debug!(sender = %sender_id, ?state, "Mic connection state changed");
                if state.is_terminal() {
                    self.remove_session(&sender_id, "transport closed");
                }
            }
        }
    }

    fn handle_command(&mut self, command: ReceiverCommand) {
        match command {
            ReceiverCommand::ForceClose {
                sender_id,
                generation,
            } => {
                if self.current_session_mut(&sender_id, generation).is_some() {
                    self.remove_session(&sender_id, "silence timeout");
                }
            }
            ReceiverCommand::Shutdown => self.shutdown(),
        }
    }

    /// The single place a session is deleted: drops it from the map, withdraws its live
    /// source, and closes the transport.
    fn remove_session(&mut self, sender_id: &str, reason: &str) {
        let Some(session) = self.sessions.remove(sender_id) else {
            return;
        };

        self.sources.send_if_modified(|sources| {
            let before = sources.len();
            sources.retain(|s| s.sender_id != sender_id);
            sources.len() != before
        });

        let peer = session.peer();
        tokio::spawn(async move {
            if let Err(e) = peer.close().await {
                tracing::debug!(error = %e, "Peer close failed");
            }
        });

        tracing::info!(
            sender = %sender_id,
            generation = session.generation,
            lifetime_secs = (chrono::Utc::now() - session.created_at).num_seconds(),
            reason,
            "Mic session closed"
        );
    }

    /// Close every session.
    pub fn shutdown(&mut self) {
        let ids: Vec<PeerId> = self.sessions.keys().cloned().collect();
        for id in ids {
            self.remove_session(&id, "receiver shutdown");
        }
    }

    /// Drain queued peer events and commands without blocking.
    pub fn process_pending(&mut self) {
        if let Some(mut events) = self.events_rx.take() {
            while let Ok(event) = events.try_recv() {
                self.handle_event(event);
            }
            self.events_rx = Some(events);
        }
        if let Some(mut commands) = self.commands_rx.take() {
            while let Ok(command) = commands.try_recv() {
                self.handle_command(command);
            }
            self.commands_rx = Some(commands);
        }
    }

    /// Run until the room connection closes or [`ReceiverHandle::shutdown`] is called.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<MicSignal>) {
        let (Some(mut events), Some(mut commands)) =
            (self.events_rx.take(), self.commands_rx.take())
        else {
            return;
        };

        loop {
            tokio::select! {
                signal = inbound.recv() => match signal {
                    Some(signal) => self.handle_signal(signal).await,
                    None => {
                        tracing::info!("Room connection closed");
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
                Some(command) = commands.recv() => match command {
                    ReceiverCommand::Shutdown => break,
                    command => self.handle_command(command),
                },
            }
        }

        self.shutdown();
        tracing::info!("Mic receiver shut down");
    }
}

async fn answer_offer(
    peer: Arc<dyn PeerConnection>,
    offer: SessionDescription,
    sender_id: PeerId,
    generation: u64,
    signaling: Arc<dyn SignalingChannel>,
    events: mpsc::UnboundedSender<ReceiverEvent>,
) {
    let result = async {
        peer.set_remote_description(offer).await?;
        let _ = events.send(ReceiverEvent::RemoteApplied {
            sender_id: sender_id.clone(),
            generation,
        });

        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        signaling.send(&MicSignal::Answer {
            target: sender_id.clone(),
            payload: answer,
        })?;
        Ok::<(), MicError>(())
    }
    .await;

    if let Err(error) = result {
        let _ = events.send(ReceiverEvent::NegotiationFailed {
            sender_id,
            generation,
            error,
        });
    }
}

async fn apply_candidates(
    peer: Arc<dyn PeerConnection>,
    candidates: Vec<IceCandidate>,
    sender_id: PeerId,
) {
    for candidate in candidates {
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            tracing::warn!(sender = %sender_id, error = %e, "Failed to add remote ICE candidate");
        }
    }
}
