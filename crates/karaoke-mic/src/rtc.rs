//! WebRTC transport on webrtc-rs.
//!
//! Outbound audio is Opus-encoded in 20 ms frames and written to a
//! `TrackLocalStaticSample`. Inbound Opus RTP is decoded back to 48 kHz mono PCM and
//! surfaced as a [`MediaStream`] via [`PeerEvent::Track`].

use crate::error::PeerError;
use crate::media::{FRAME_SAMPLES, MediaStream, SAMPLE_RATE};
use crate::protocol::{IceCandidate, IceServer, SdpType, SessionDescription};
use crate::transport::{
    CandidatePairState, ConnectionState, PeerConnection, PeerEvent, PeerEventSink, PeerFactory,
    StatsReport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice::candidate::CandidatePairState as RtcPairState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// Largest Opus frame (120 ms) at 48 kHz.
const MAX_DECODED_SAMPLES: usize = 5_760;
const MAX_PACKET_BYTES: usize = 1_500;
const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Creates webrtc-rs peer connections with Opus registered.
pub struct RtcPeerFactory {
    api: API,
    ice_servers: Vec<IceServer>,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: Vec<IceServer>) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, ice_servers })
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let pc = Arc::new(self.api.new_peer_connection(self.configuration()).await?);
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let ice_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = ice_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.emit(PeerEvent::LocalCandidate(from_rtc_candidate(init))),
                    Err(e) => tracing::debug!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            if let Some(state) = map_connection_state(state) {
                state_events.emit(PeerEvent::ConnectionState(state));
            }
            Box::pin(async {})
        }));

        let track_events = events;
        let track_tasks = tasks.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let codec = track.codec();
            if codec.capability.mime_type.eq_ignore_ascii_case(MIME_TYPE_OPUS) {
                let stream = MediaStream::new(format!("remote-{}", track.ssrc()));
                track_events.emit(PeerEvent::Track(stream.clone()));
                let handle = tokio::spawn(decode_track(track, stream));
                track_tasks.lock().push(handle);
            } else {
                tracing::debug!(mime = %codec.capability.mime_type, "Ignoring non-Opus track");
            }
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcPeer {
            pc,
            tasks,
            closed: AtomicBool::new(false),
        }))
    }
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_audio_track(&self, stream: MediaStream) -> Result<(), PeerError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: SAMPLE_RATE,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "karaoke-mic".to_owned(),
        ));

        let rtp_sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let encoder = opus::Encoder::new(
            SAMPLE_RATE,
            opus::Channels::Mono,
            opus::Application::Voip,
        )?;

        let rtcp = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_BYTES];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });
        let encode = tokio::spawn(encode_track(stream, track, encoder));
        self.tasks.lock().extend([rtcp, encode]);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_local_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_remote_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<Vec<StatsReport>, PeerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PeerError::Closed);
        }
        let report = self.pc.get_stats().await;
        Ok(report
            .reports
            .values()
            .map(|entry| match entry {
                StatsReportType::CandidatePair(pair) => StatsReport::CandidatePair {
                    state: map_pair_state(pair.state),
                    current_round_trip_time: Some(pair.current_round_trip_time),
                },
                _ => StatsReport::Other,
            })
            .collect())
    }

    async fn close(&self) -> Result<(), PeerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.pc.close().await?;
        Ok(())
    }
}

async fn encode_track(
    stream: MediaStream,
    track: Arc<TrackLocalStaticSample>,
    mut encoder: opus::Encoder,
) {
    let mut frame = vec![0.0f32; FRAME_SAMPLES];
    let mut packet = vec![0u8; MAX_PACKET_BYTES];
    let mut ticker = tokio::time::interval(FRAME_DURATION);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);

    loop {
        ticker.tick().await;
        if stream.is_ended() {
            break;
        }
        while stream.buffered() >= FRAME_SAMPLES {
            stream.read(&mut frame);
            let len = match encoder.encode_float(&frame, &mut packet) {
                Ok(len) => len,
                Err(e) => {
                    tracing::warn!(error = %e, "Opus encode failed");
                    continue;
                }
            };
            let sample = Sample {
                data: packet[..len].to_vec().into(),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                tracing::debug!(error = %e, "Track write failed, stopping encoder");
                return;
            }
        }
    }
}

async fn decode_track(track: Arc<TrackRemote>, stream: MediaStream) {
    let mut decoder = match opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono) {
        Ok(decoder) => decoder,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create Opus decoder");
            stream.end();
            return;
        }
    };
    let mut pcm = vec![0.0f32; MAX_DECODED_SAMPLES];

    loop {
        let packet = match track.read_rtp().await {
            Ok((packet, _)) => packet,
            Err(e) => {
                tracing::debug!(error = %e, "Remote track ended");
                break;
            }
        };
        if packet.payload.is_empty() {
            continue;
        }
        match decoder.decode_float(&packet.payload, &mut pcm, false) {
            Ok(n) => stream.push(&pcm[..n]),
            Err(e) => tracing::debug!(error = %e, "Dropping undecodable Opus packet"),
        }
    }
    stream.end();
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => return Err(PeerError::Sdp(format!("unsupported SDP type {other}"))),
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let rtc = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpType::Rollback => {
            return Err(PeerError::Sdp("rollback is not supported".into()));
        }
    };
    Ok(rtc)
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => return None,
    })
}

fn map_pair_state(state: RtcPairState) -> CandidatePairState {
    match state {
        RtcPairState::Waiting => CandidatePairState::Waiting,
        RtcPairState::InProgress => CandidatePairState::InProgress,
        RtcPairState::Succeeded => CandidatePairState::Succeeded,
        RtcPairState::Failed => CandidatePairState::Failed,
        _ => CandidatePairState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_conversion() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";
        let rtc = to_rtc_description(SessionDescription::answer(sdp)).unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Answer);
        let back = from_rtc_description(rtc).unwrap();
        assert_eq!(back, SessionDescription::answer(sdp));

        assert!(to_rtc_description(SessionDescription {
            kind: SdpType::Rollback,
            sdp: String::new(),
        })
        .is_err());
    }

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Failed),
            Some(ConnectionState::Failed)
        );
        assert_eq!(map_connection_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(
            map_pair_state(RtcPairState::Succeeded),
            CandidatePairState::Succeeded
        );
    }

    #[tokio::test]
    async fn test_factory_offers_opus() {
        let factory = RtcPeerFactory::new(Vec::new()).unwrap();
        let peer = factory.create(PeerEventSink::new(|_| {})).await.unwrap();
        peer.add_audio_track(MediaStream::new("mic")).await.unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpType::Offer);
        assert!(offer.sdp.to_lowercase().contains("opus/48000"));

        peer.close().await.unwrap();
        peer.close().await.unwrap();
        assert!(matches!(peer.stats().await, Err(PeerError::Closed)));
    }
}
