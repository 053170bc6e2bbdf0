//! Guest side: capture the local microphone and stream it to the room host.
//!
//! [`MicSender`] owns at most one live session (capture + peer connection). It runs as
//! a single event loop fed by user commands, inbound room signals, and peer events, so
//! toggling, answers, and candidates can never race each other.

use crate::error::MicError;
use crate::media::MediaStream;
use crate::protocol::MicSignal;
use crate::transport::{
    CaptureDevice, CaptureStream, ConnectionState, PeerConnection, PeerEvent, PeerEventSink,
    PeerFactory, SignalingChannel,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Externally visible sender state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MicState {
    pub mic_on: bool,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderCommand {
    Start,
    Stop,
    Toggle,
}

struct ActiveMic {
    generation: u64,
    peer: Arc<dyn PeerConnection>,
    capture: Box<dyn CaptureStream>,
}

pub struct MicSender {
    factory: Arc<dyn PeerFactory>,
    capture: Arc<dyn CaptureDevice>,
    signaling: Arc<dyn SignalingChannel>,
    active: Option<ActiveMic>,
    generation: u64,
    events_tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
    events_rx: Option<mpsc::UnboundedReceiver<(u64, PeerEvent)>>,
    state: watch::Sender<MicState>,
}

impl MicSender {
    pub fn new(
        factory: Arc<dyn PeerFactory>,
        capture: Arc<dyn CaptureDevice>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(MicState::default());
        Self {
            factory,
            capture,
            signaling,
            active: None,
            generation: 0,
            events_tx,
            events_rx: Some(events_rx),
            state,
        }
    }

    pub fn state(&self) -> MicState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<MicState> {
        self.state.subscribe()
    }

    pub fn is_on(&self) -> bool {
        self.active.is_some()
    }

    /// Open the microphone, create a peer connection, and broadcast an offer.
    ///
    /// The mic is reported on only once the offer has been handed to the relay. On
    /// failure everything acquired so far is released and the mic stays off.
    pub async fn start(&mut self) -> Result<(), MicError> {
        if self.active.is_some() {
            return Ok(());
        }

        let active = self.open_session().await?;
        tracing::info!(generation = active.generation, "Mic started");
        self.active = Some(active);
        self.state.send_modify(|s| {
            s.mic_on = true;
            s.connected = false;
        });
        Ok(())
    }

    async fn open_session(&mut self) -> Result<ActiveMic, MicError> {
        let mut capture = self.capture.open().await?;

        self.generation += 1;
        let generation = self.generation;
        let tx = self.events_tx.clone();
        let sink = PeerEventSink::new(move |event| {
            let _ = tx.send((generation, event));
        });

        let peer = match self.factory.create(sink).await {
            Ok(peer) => peer,
            Err(e) => {
                capture.stop();
                return Err(e.into());
            }
        };

        let stream = capture.stream();
        if let Err(e) = offer_mic(peer.as_ref(), stream, self.signaling.as_ref()).await {
            capture.stop();
            if let Err(close_err) = peer.close().await {
                tracing::debug!(error = %close_err, "Failed to close peer after setup error");
            }
            return Err(e);
        }

        Ok(ActiveMic {
            generation,
            peer,
            capture,
        })
    }

    /// Release capture and close the peer connection. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.capture.stop();
            if let Err(e) = active.peer.close().await {
                tracing::debug!(error = %e, "Peer close failed");
            }
            tracing::info!(generation = active.generation, "Mic stopped");
        }
        self.state.send_replace(MicState::default());
    }

    pub async fn toggle(&mut self) -> Result<(), MicError> {
        if self.active.is_some() {
            self.stop().await;
            Ok(())
        } else {
            self.start().await
        }
    }

    pub async fn apply(&mut self, command: SenderCommand) -> Result<(), MicError> {
        match command {
            SenderCommand::Start => self.start().await,
            SenderCommand::Stop => {
                self.stop().await;
                Ok(())
            }
            SenderCommand::Toggle => self.toggle().await,
        }
    }

    fn current_peer(&self) -> Option<Arc<dyn PeerConnection>> {
        self.active.as_ref().map(|a| a.peer.clone())
    }

    /// Handle a signal from the room. Offers and unrelated traffic are ignored.
    pub async fn handle_signal(&mut self, signal: MicSignal) {
        match signal {
            MicSignal::Answer { payload, .. } => {
                let Some(peer) = self.current_peer() else {
                    tracing::debug!("Answer received with no active mic session");
                    return;
                };
                if let Err(e) = peer.set_remote_description(payload).await {
                    tracing::warn!(error = %e, "Failed to apply answer");
                }
            }
            // Only the receiver targets candidates; untargeted ones belong to other senders.
            MicSignal::Candidate {
                target: Some(_),
                payload,
                ..
            } => {
                let Some(peer) = self.current_peer() else {
                    tracing::debug!("Candidate received with no active mic session");
                    return;
                };
                if let Err(e) = peer.add_ice_candidate(payload).await {
                    tracing::warn!(error = %e, "Failed to add remote ICE candidate");
                }
            }
            _ => {}
        }
    }

    fn handle_peer_event(&mut self, generation: u64, event: PeerEvent) {
        let current = self.active.as_ref().map(|a| a.generation);
        if current != Some(generation) {
            tracing::debug!(generation, "Ignoring event from a closed mic session");
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let signal = MicSignal::Candidate {
                    from: None,
                    target: None,
                    payload: candidate,
                };
                if let Err(e) = self.signaling.send(&signal) {
                    tracing::warn!(error = %e, "Failed to send ICE candidate");
                }
            }
            PeerEvent::ConnectionState(state) => {
                tracing::debug!(?state, "Mic connection state changed");
                let connected = state == ConnectionState::Connected;
                if connected || state.is_terminal() {
                    self.state.send_modify(|s| s.connected = connected);
                }
            }
            PeerEvent::Track(_) => {}
        }
    }

    /// Drain peer events queued so far without blocking.
    pub fn process_pending(&mut self) {
        let Some(mut events) = self.events_rx.take() else {
            return;
        };
        while let Ok((generation, event)) = events.try_recv() {
            self.handle_peer_event(generation, event);
        }
        self.events_rx = Some(events);
    }

    /// Run until the command channel closes, then release the microphone.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<MicSignal>,
        mut commands: mpsc::Receiver<SenderCommand>,
    ) {
        let Some(mut events) = self.events_rx.take() else {
            return;
        };

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.apply(command).await {
                            tracing::error!(error = %e, ?command, "Mic command failed");
                        }
                    }
                    None => break,
                },
                Some(signal) = inbound.recv() => self.handle_signal(signal).await,
                Some((generation, event)) = events.recv() => {
                    self.handle_peer_event(generation, event);
                }
            }
        }

        self.stop().await;
        tracing::info!("Mic sender shut down");
    }
}

async fn offer_mic(
    peer: &dyn PeerConnection,
    stream: MediaStream,
    signaling: &dyn SignalingChannel,
) -> Result<(), MicError> {
    peer.add_audio_track(stream).await?;
    let offer = peer.create_offer().await?;
    peer.set_local_description(offer.clone()).await?;
    signaling.send(&MicSignal::Offer {
        from: None,
        payload: offer,
    })?;
    Ok(())
}

impl Drop for MicSender {
    fn drop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.capture.stop();
            let peer = active.peer;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = peer.close().await;
                });
            }
        }
    }
}
