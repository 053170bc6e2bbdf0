//! In-memory fakes for the transport seams.

use crate::error::{MicError, PeerError, SignalError};
use crate::media::MediaStream;
use crate::protocol::{IceCandidate, MicSignal, SessionDescription};
use crate::transport::{
    CaptureDevice, CaptureStream, PeerConnection, PeerEvent, PeerEventSink, PeerFactory,
    SignalingChannel, StatsReport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq)]
pub enum PeerCall {
    AddTrack,
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

pub struct FakePeer {
    pub sink: PeerEventSink,
    pub calls: Mutex<Vec<PeerCall>>,
    pub stats: Mutex<Result<Vec<StatsReport>, ()>>,
    closed: AtomicBool,
}

impl FakePeer {
    pub fn new(sink: PeerEventSink) -> Self {
        Self {
            sink,
            calls: Mutex::new(Vec::new()),
            stats: Mutex::new(Ok(Vec::new())),
            closed: AtomicBool::new(false),
        }
    }

    pub fn emit(&self, event: PeerEvent) {
        self.sink.emit(event);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PeerCall::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: PeerCall) -> Result<(), PeerError> {
        if self.is_closed() && call != PeerCall::Close {
            return Err(PeerError::Closed);
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_audio_track(&self, _stream: MediaStream) -> Result<(), PeerError> {
        self.record(PeerCall::AddTrack)
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.record(PeerCall::CreateOffer)?;
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.record(PeerCall::CreateAnswer)?;
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.record(PeerCall::SetLocal(desc))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.record(PeerCall::SetRemote(desc))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.record(PeerCall::AddCandidate(candidate))
    }

    async fn stats(&self) -> Result<Vec<StatsReport>, PeerError> {
        self.stats.lock().clone().map_err(|_| PeerError::Closed)
    }

    async fn close(&self) -> Result<(), PeerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.calls.lock().push(PeerCall::Close);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    pub peers: Mutex<Vec<Arc<FakePeer>>>,
    pub fail: AtomicBool,
}

impl FakeFactory {
    pub fn peer(&self, index: usize) -> Arc<FakePeer> {
        self.peers.lock()[index].clone()
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn open_peers(&self) -> usize {
        self.peers.lock().iter().filter(|p| !p.is_closed()).count()
    }
}

#[async_trait]
impl PeerFactory for FakeFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PeerError::Closed);
        }
        let peer = Arc::new(FakePeer::new(events));
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

#[derive(Default)]
pub struct FakeSignaling {
    pub sent: Mutex<Vec<MicSignal>>,
}

impl FakeSignaling {
    pub fn sent(&self) -> Vec<MicSignal> {
        self.sent.lock().clone()
    }
}

impl SignalingChannel for FakeSignaling {
    fn send(&self, signal: &MicSignal) -> Result<(), SignalError> {
        self.sent.lock().push(signal.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCapture {
    pub opened: AtomicUsize,
    pub live: Arc<AtomicUsize>,
    pub deny: AtomicBool,
}

impl FakeCapture {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

struct FakeCaptureStream {
    stream: MediaStream,
    live: Arc<AtomicUsize>,
    stopped: bool,
}

impl CaptureStream for FakeCaptureStream {
    fn stream(&self) -> MediaStream {
        self.stream.clone()
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeCaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl CaptureDevice for FakeCapture {
    async fn open(&self) -> Result<Box<dyn CaptureStream>, MicError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MicError::DeviceUnavailable("permission denied".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCaptureStream {
            stream: MediaStream::new("fake-mic"),
            live: self.live.clone(),
            stopped: false,
        }))
    }
}
