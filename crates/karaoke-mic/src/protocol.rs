//! Mic signaling protocol carried over the room relay.
//!
//! Messages are JSON objects discriminated by `type`:
//! - `mic:offer`: sender → everyone, SDP offer for a new microphone session
//! - `mic:answer`: receiver → one sender (`target`), SDP answer
//! - `mic:candidate`: either direction, trickled ICE candidate
//!
//! The relay stamps `from` with the originating connection id. Anything else in the
//! room (chat, presence, playlist) deserializes to [`MicSignal::Other`] and is ignored.

use serde::{Deserialize, Serialize};

/// Connection identifier assigned by the room relay.
pub type PeerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// An SDP blob in the same shape browsers use for `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate (`RTCIceCandidateInit`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Mic signaling messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MicSignal {
    #[serde(rename = "mic:offer")]
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        payload: SessionDescription,
    },

    #[serde(rename = "mic:answer")]
    Answer {
        target: PeerId,
        payload: SessionDescription,
    },

    /// `target` is set only on candidates sent by the receiver.
    #[serde(rename = "mic:candidate")]
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<PeerId>,
        payload: IceCandidate,
    },

    /// Any other room message.
    #[serde(other)]
    Other,
}

impl MicSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            MicSignal::Offer { .. } => "mic:offer",
            MicSignal::Answer { .. } => "mic:answer",
            MicSignal::Candidate { .. } => "mic:candidate",
            MicSignal::Other => "other",
        }
    }
}

/// ICE server configuration (STUN/TURN).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    /// Public STUN servers used when nothing is configured.
    pub fn default_stun() -> Vec<Self> {
        Self::from_urls(vec!["stun:stun.l.google.com:19302".to_string()])
    }

    pub fn from_urls(urls: Vec<String>) -> Vec<Self> {
        if urls.is_empty() {
            return Vec::new();
        }
        vec![Self {
            urls,
            username: None,
            credential: None,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_wire_shape() {
        let signal = MicSignal::Offer {
            from: None,
            payload: SessionDescription::offer("v=0"),
        };
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(
            value,
            json!({ "type": "mic:offer", "payload": { "type": "offer", "sdp": "v=0" } })
        );
    }

    #[test]
    fn test_candidate_from_relay() {
        let raw = json!({
            "type": "mic:candidate",
            "from": "abcd-1234",
            "payload": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": "uf"
            }
        });
        let signal: MicSignal = serde_json::from_value(raw).unwrap();
        match signal {
            MicSignal::Candidate { from, target, payload } => {
                assert_eq!(from.as_deref(), Some("abcd-1234"));
                assert!(target.is_none());
                assert_eq!(payload.sdp_mid.as_deref(), Some("0"));
                assert_eq!(payload.sdp_m_line_index, Some(0));
                assert_eq!(payload.username_fragment.as_deref(), Some("uf"));
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[test]
    fn test_answer_keeps_target() {
        let raw = r#"{"type":"mic:answer","target":"s1","from":"r1","payload":{"type":"answer","sdp":"v=0"}}"#;
        let signal: MicSignal = serde_json::from_str(raw).unwrap();
        assert_eq!(
            signal,
            MicSignal::Answer {
                target: "s1".into(),
                payload: SessionDescription::answer("v=0"),
            }
        );
    }

    #[test]
    fn test_unrelated_room_traffic_is_other() {
        let raw = r#"{"type":"chat","text":"hello","from":"x"}"#;
        let signal: MicSignal = serde_json::from_str(raw).unwrap();
        assert_eq!(signal, MicSignal::Other);
        assert_eq!(signal.kind(), "other");
    }

    #[test]
    fn test_default_stun() {
        let servers = IceServer::default_stun();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].urls[0].starts_with("stun:"));
        assert!(IceServer::from_urls(Vec::new()).is_empty());
    }
}
