//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = builder()?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (KARAOKE__SERVER__PORT, KARAOKE__MIC__SILENCE_TIMEOUT_SECS, etc.)
        .add_source(
            config::Environment::with_prefix("KARAOKE")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("ice.stun_urls")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Defaults only, no file or environment sources.
pub fn defaults() -> Result<AppConfig, config::ConfigError> {
    builder()?.build()?.try_deserialize()
}

fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
    config::Config::builder()
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 1999)?
        .set_default("signaling.url", "ws://127.0.0.1:1999")?
        .set_default("signaling.room", "")?
        .set_default("signaling.max_room_size", 64)?
        .set_default("ice.stun_urls", vec!["stun:stun.l.google.com:19302"])?
        .set_default("mic.silence_timeout_secs", 40.0)?
        .set_default("mic.silence_warn_secs", 5.0)?
        .set_default("mic.silence_threshold", 10.0)?
        .set_default("mic.analysis_interval_ms", 16)?
        .set_default("mic.stats_interval_ms", 2000)?
        .set_default("mic.fft_size", 32)?
        .set_default("mic.noise_suppression", true)?
        .set_default("effects.reverb_seconds", 2.0)?
        .set_default("effects.reverb_decay", 2.5)?
        .set_default("effects.wet_gain_factor", 0.6)?
        .set_default("effects.ramp_time_constant_ms", 100)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub signaling: SignalingConfig,
    pub ice: IceConfig,
    pub mic: MicSettings,
    pub effects: EffectSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    /// Base URL of the relay, e.g. `ws://127.0.0.1:1999`.
    pub url: String,
    /// Default room (party hash) joined by `host` / `guest` when none is given.
    pub room: String,
    /// Connections accepted per room before the relay rejects upgrades.
    pub max_room_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MicSettings {
    /// Continuous silence after which a live mic is force-closed.
    pub silence_timeout_secs: f64,
    /// Silence after which the panel starts showing the close countdown.
    pub silence_warn_secs: f64,
    /// Average byte-frequency level (0–255) under which a sample counts as silent.
    pub silence_threshold: f32,
    pub analysis_interval_ms: u64,
    pub stats_interval_ms: u64,
    /// Analyser FFT size; yields `fft_size / 2` frequency bins.
    pub fft_size: usize,
    pub noise_suppression: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EffectSettings {
    /// Length of the generated reverb impulse response.
    pub reverb_seconds: f32,
    /// Exponential decay applied across the impulse response.
    pub reverb_decay: f32,
    /// Wet level = volume × intensity × this factor.
    pub wet_gain_factor: f32,
    /// Time constant for click-free gain transitions.
    pub ramp_time_constant_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_production_values() {
        let cfg = defaults().expect("defaults should deserialize");
        assert_eq!(cfg.server.port, 1999);
        assert_eq!(cfg.mic.silence_timeout_secs, 40.0);
        assert_eq!(cfg.mic.silence_warn_secs, 5.0);
        assert_eq!(cfg.mic.fft_size, 32);
        assert_eq!(cfg.effects.ramp_time_constant_ms, 100);
        assert_eq!(cfg.ice.stun_urls, vec!["stun:stun.l.google.com:19302"]);
    }
}
