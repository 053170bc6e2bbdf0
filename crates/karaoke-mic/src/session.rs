//! Per-sender negotiation state held by the receiver.

use crate::protocol::{IceCandidate, PeerId};
use crate::transport::PeerConnection;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Candidates buffered before the remote description lands.
const MAX_PENDING_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Offer received, remote description not yet applied.
    AwaitingRemote,
    /// Remote description applied; candidates go straight to the transport.
    RemoteApplied,
}

pub struct PeerSession {
    pub sender_id: PeerId,
    /// Distinguishes this session from earlier ones for the same sender.
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    peer: Arc<dyn PeerConnection>,
    state: NegotiationState,
    pending_candidates: Vec<IceCandidate>,
}

impl PeerSession {
    pub fn new(sender_id: PeerId, generation: u64, peer: Arc<dyn PeerConnection>) -> Self {
        Self {
            sender_id,
            generation,
            created_at: Utc::now(),
            peer,
            state: NegotiationState::AwaitingRemote,
            pending_candidates: Vec::new(),
        }
    }

    pub fn peer(&self) -> Arc<dyn PeerConnection> {
        self.peer.clone()
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Returns the candidate if it can be applied now, or queues it.
    pub fn accept_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        match self.state {
            NegotiationState::RemoteApplied => Some(candidate),
            NegotiationState::AwaitingRemote => {
                if self.pending_candidates.len() >= MAX_PENDING_CANDIDATES {
                    tracing::debug!(sender = %self.sender_id, "Pending candidate queue full, dropping oldest");
                    self.pending_candidates.remove(0);
                }
                self.pending_candidates.push(candidate);
                None
            }
        }
    }

    /// Mark the remote description applied and hand back everything queued so far.
    pub fn remote_applied(&mut self) -> Vec<IceCandidate> {
        self.state = NegotiationState::RemoteApplied;
        std::mem::take(&mut self.pending_candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePeer;
    use crate::transport::PeerEventSink;

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n}"),
            ..Default::default()
        }
    }

    #[test]
    fn test_candidates_queue_until_remote_applied() {
        let peer = Arc::new(FakePeer::new(PeerEventSink::new(|_| {})));
        let mut session = PeerSession::new("a".into(), 1, peer);

        assert!(session.accept_candidate(candidate(1)).is_none());
        assert!(session.accept_candidate(candidate(2)).is_none());
        assert_eq!(session.remote_applied(), vec![candidate(1), candidate(2)]);
        assert_eq!(session.state(), NegotiationState::RemoteApplied);
        assert_eq!(session.accept_candidate(candidate(3)), Some(candidate(3)));
        assert!(session.remote_applied().is_empty());
    }

    #[test]
    fn test_pending_queue_is_bounded() {
        let peer = Arc::new(FakePeer::new(PeerEventSink::new(|_| {})));
        let mut session = PeerSession::new("a".into(), 1, peer);
        for n in 0..MAX_PENDING_CANDIDATES + 3 {
            session.accept_candidate(candidate(n));
        }
        let flushed = session.remote_applied();
        assert_eq!(flushed.len(), MAX_PENDING_CANDIDATES);
        assert_eq!(flushed[0], candidate(3));
    }
}
