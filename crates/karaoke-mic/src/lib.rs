//! # karaoke-mic
//!
//! Live microphone relay for karaoke parties.
//!
//! Guests turn their phone or laptop into a wireless mic: the [`sender::MicSender`]
//! captures audio and streams it over WebRTC to the room host. The host runs one
//! [`receiver::MicReceiver`] that accepts any number of concurrent senders and exposes
//! them as live sources. The [`panel::MicPanel`] gives every live source its own audio
//! graph (volume, mute, reverb, level meter), shows connection quality, and closes mics
//! that have been silent too long.
//!
//! Signaling rides the room relay (`mic:offer` / `mic:answer` / `mic:candidate`); media
//! flows peer-to-peer, never through the relay.
//!
//! ```text
//!  guest: capture ─► MicSender ─► PeerConnection ═══ media ═══╗
//!                        ▲ │                                   ║
//!                        │ ▼                                   ▼
//!                   room relay ◄──────────────────────► MicReceiver ─► MicPanel ─► speakers
//! ```

pub mod controller;
pub mod device;
pub mod dsp;
pub mod error;
pub mod media;
pub mod panel;
pub mod protocol;
pub mod quality;
pub mod receiver;
pub mod resample;
pub mod room;
pub mod rtc;
pub mod sender;
pub mod session;
pub mod silence;
pub mod transport;

#[cfg(test)]
mod testing;

use karaoke_common::config::AppConfig;
use protocol::IceServer;
use std::time::Duration;

/// Tunables for senders, the receiver, and the mixer.
#[derive(Debug, Clone)]
pub struct MicConfig {
    /// Silence longer than this closes the mic.
    pub silence_timeout: Duration,
    /// Silence longer than this shows a countdown.
    pub silence_warn: Duration,
    /// Average byte-spectrum level below which a stream counts as silent.
    pub silence_threshold: f32,
    pub analysis_interval: Duration,
    pub stats_interval: Duration,
    pub fft_size: usize,
    pub noise_suppression: bool,
    pub reverb_seconds: f32,
    pub reverb_decay: f32,
    pub wet_gain_factor: f32,
    pub ramp_time_constant: Duration,
    pub ice_servers: Vec<IceServer>,
}

impl Default for MicConfig {
    fn default() -> Self {
        Self {
            silence_timeout: Duration::from_secs(40),
            silence_warn: Duration::from_secs(5),
            silence_threshold: 10.0,
            analysis_interval: Duration::from_millis(16),
            stats_interval: Duration::from_secs(2),
            fft_size: 32,
            noise_suppression: true,
            reverb_seconds: 2.0,
            reverb_decay: 2.5,
            wet_gain_factor: 0.6,
            ramp_time_constant: Duration::from_millis(100),
            ice_servers: IceServer::default_stun(),
        }
    }
}

impl From<&AppConfig> for MicConfig {
    fn from(config: &AppConfig) -> Self {
        let mic = &config.mic;
        let effects = &config.effects;
        Self {
            silence_timeout: Duration::from_secs_f64(mic.silence_timeout_secs.max(0.0)),
            silence_warn: Duration::from_secs_f64(mic.silence_warn_secs.max(0.0)),
            silence_threshold: mic.silence_threshold,
            analysis_interval: Duration::from_millis(mic.analysis_interval_ms.max(1)),
            stats_interval: Duration::from_millis(mic.stats_interval_ms.max(1)),
            fft_size: mic.fft_size,
            noise_suppression: mic.noise_suppression,
            reverb_seconds: effects.reverb_seconds,
            reverb_decay: effects.reverb_decay,
            wet_gain_factor: effects.wet_gain_factor,
            ramp_time_constant: Duration::from_millis(effects.ramp_time_constant_ms),
            ice_servers: IceServer::from_urls(config.ice.stun_urls.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_conversion_matches_defaults() {
        let app = karaoke_common::config::defaults().unwrap();
        let from_app = MicConfig::from(&app);
        let default = MicConfig::default();

        assert_eq!(from_app.silence_timeout, default.silence_timeout);
        assert_eq!(from_app.silence_warn, default.silence_warn);
        assert_eq!(from_app.fft_size, default.fft_size);
        assert_eq!(from_app.stats_interval, default.stats_interval);
        assert_eq!(from_app.ice_servers, default.ice_servers);
    }
}
