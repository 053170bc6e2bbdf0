//! Seams between the mic logic and the outside world.
//!
//! The sender and receiver only talk to these traits. [`crate::rtc`] implements the
//! peer side on top of webrtc-rs, [`crate::device`] implements capture on cpal, and
//! [`crate::room`] implements signaling over the room WebSocket. Tests swap in fakes.

use crate::error::{MicError, PeerError, SignalError};
use crate::media::MediaStream;
use crate::protocol::{IceCandidate, MicSignal, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;

/// Aggregate transport state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the session is torn down.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// Events raised by a peer connection. They are delivered into the owner's event loop,
/// never handled on the transport's own tasks.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    Track(MediaStream),
    ConnectionState(ConnectionState),
}

/// Callback handed to [`PeerFactory::create`] for forwarding [`PeerEvent`]s.
#[derive(Clone)]
pub struct PeerEventSink(Arc<dyn Fn(PeerEvent) + Send + Sync>);

impl PeerEventSink {
    pub fn new(f: impl Fn(PeerEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn emit(&self, event: PeerEvent) {
        (self.0)(event)
    }
}

impl std::fmt::Debug for PeerEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PeerEventSink")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePairState {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
    Unknown,
}

/// The subset of transport statistics the mixer reads.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsReport {
    CandidatePair {
        state: CandidatePairState,
        /// Seconds.
        current_round_trip_time: Option<f64>,
    },
    Other,
}

/// One WebRTC peer connection carrying a single audio track.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_audio_track(&self, stream: MediaStream) -> Result<(), PeerError>;
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn stats(&self) -> Result<Vec<StatsReport>, PeerError>;
    /// Idempotent.
    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

/// A running capture. Dropping it must release the device as well.
pub trait CaptureStream: Send + Sync {
    fn stream(&self) -> MediaStream;
    /// Idempotent.
    fn stop(&mut self);
}

#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Fails with [`MicError::DeviceUnavailable`] when access is denied or no device exists.
    async fn open(&self) -> Result<Box<dyn CaptureStream>, MicError>;
}

/// Outbound half of the room relay.
pub trait SignalingChannel: Send + Sync {
    fn send(&self, signal: &MicSignal) -> Result<(), SignalError>;
}
