//! Host-side mixer panel.
//!
//! Lists every live mic with a level meter, round-trip time, and silence countdown,
//! and applies one set of [`MixSettings`] to all of them. Metering and silence close run
//! for every live mic from the start. Playback graphs are only built once the user arms
//! audio with [`MicPanel::enable_audio`]; if playback later fails the panel drops back
//! to unarmed and asks again.

use crate::MicConfig;
use crate::controller::StreamController;
use crate::dsp::{MixSettings, reverb_impulse};
use crate::protocol::PeerId;
use crate::quality::RoundTrip;
use crate::receiver::{LiveSource, SessionCloser};
use karaoke_common::id::short_id;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

const IMPULSE_SEED: u64 = 0x6b61_7261_6f6b_6521;
const METER_WIDTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioLifecycle {
    Unarmed,
    Armed,
}

/// One line of the panel.
#[derive(Debug, Clone, PartialEq)]
pub struct MicRow {
    pub sender_id: PeerId,
    pub short_id: String,
    /// Meter fill, `0.0..=1.0`.
    pub level: f32,
    pub hot: bool,
    pub round_trip: RoundTrip,
    pub closing_in: Option<Duration>,
}

impl fmt::Display for MicRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let filled = (self.level.clamp(0.0, 1.0) * METER_WIDTH as f32).round() as usize;
        let bar = format!("{}{}", "#".repeat(filled), " ".repeat(METER_WIDTH - filled));
        write!(f, "{:<4} [{bar}] {:>6}", self.short_id, self.round_trip.to_string())?;
        if let Some(remaining) = self.closing_in {
            write!(f, "  Closing in {:.0}s", remaining.as_secs_f64())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PanelSnapshot {
    pub header: String,
    pub needs_enable_prompt: bool,
    pub settings: MixSettings,
    pub rows: Vec<MicRow>,
}

#[derive(Debug)]
pub enum PanelCommand {
    EnableAudio,
    PlaybackFailed,
    SetMuted(bool),
    ToggleMute,
    SetVolume(f32),
    SetEffectEnabled(bool),
    SetEffectIntensity(f32),
    Snapshot(oneshot::Sender<PanelSnapshot>),
}

/// Sums every controller's output for the playback device.
#[derive(Clone, Default)]
pub struct Mixer {
    inner: Arc<Mutex<MixerInner>>,
}

#[derive(Default)]
struct MixerInner {
    outputs: Vec<crate::media::MediaStream>,
    scratch: Vec<f32>,
}

impl Mixer {
    fn set_outputs(&self, outputs: Vec<crate::media::MediaStream>) {
        self.inner.lock().outputs = outputs;
    }

    pub fn source_count(&self) -> usize {
        self.inner.lock().outputs.len()
    }

    /// Fill `out` with the mix of all live outputs.
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        let mut inner = self.inner.lock();
        let MixerInner { outputs, scratch } = &mut *inner;
        scratch.resize(out.len(), 0.0);
        for stream in outputs.iter() {
            let n = stream.read(scratch);
            for (y, x) in out.iter_mut().zip(&scratch[..n]) {
                *y += x;
            }
        }
        for y in out.iter_mut() {
            *y = y.clamp(-1.0, 1.0);
        }
    }
}

pub struct MicPanel {
    config: MicConfig,
    settings: MixSettings,
    lifecycle: AudioLifecycle,
    sources: Vec<LiveSource>,
    controllers: HashMap<PeerId, StreamController>,
    impulse: Option<Arc<Vec<f32>>>,
    closer: Arc<dyn SessionCloser>,
    mixer: Mixer,
}

impl MicPanel {
    pub fn new(config: MicConfig, closer: Arc<dyn SessionCloser>) -> Self {
        Self {
            config,
            settings: MixSettings::default(),
            lifecycle: AudioLifecycle::Unarmed,
            sources: Vec::new(),
            controllers: HashMap::new(),
            impulse: None,
            closer,
            mixer: Mixer::default(),
        }
    }

    pub fn lifecycle(&self) -> AudioLifecycle {
        self.lifecycle
    }

    pub fn settings(&self) -> MixSettings {
        self.settings
    }

    pub fn mixer(&self) -> Mixer {
        self.mixer.clone()
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    /// Controllers with a playback graph attached.
    pub fn playing_count(&self) -> usize {
        self.controllers.values().filter(|c| c.is_playing()).count()
    }

    /// Live mics exist but audio has not been armed.
    pub fn needs_enable_prompt(&self) -> bool {
        self.lifecycle == AudioLifecycle::Unarmed && !self.sources.is_empty()
    }

    pub fn enable_audio(&mut self) {
        if self.lifecycle == AudioLifecycle::Armed {
            return;
        }
        if self.impulse.is_none() {
            self.impulse = Some(Arc::new(reverb_impulse(
                crate::media::SAMPLE_RATE,
                self.config.reverb_seconds,
                self.config.reverb_decay,
                IMPULSE_SEED,
            )));
        }
        self.lifecycle = AudioLifecycle::Armed;
        tracing::info!("Audio enabled");
        self.reconcile();
    }

    /// Playback could not start or stopped unexpectedly; drop back to unarmed.
    pub fn playback_failed(&mut self) {
        tracing::warn!("Playback failed, audio needs to be enabled again");
        self.lifecycle = AudioLifecycle::Unarmed;
        for controller in self.controllers.values() {
            controller.detach_playback();
        }
        self.mixer.set_outputs(Vec::new());
    }

    pub fn sync_sources(&mut self, sources: Vec<LiveSource>) {
        self.sources = sources;
        self.reconcile();
    }

    fn reconcile(&mut self) {
        let sources = &self.sources;
        self.controllers.retain(|id, controller| {
            sources
                .iter()
                .any(|s| s.sender_id == *id && s.generation == controller.generation())
        });

        for source in &self.sources {
            if self.controllers.contains_key(&source.sender_id) {
                continue;
            }
            match StreamController::spawn(source.clone(), &self.config, self.closer.clone()) {
                Ok(controller) => {
                    self.controllers.insert(source.sender_id.clone(), controller);
                }
                Err(e) => {
                    tracing::warn!(sender = %source.sender_id, error = %e, "Failed to start stream controller");
                }
            }
        }

        if self.lifecycle == AudioLifecycle::Unarmed {
            self.mixer.set_outputs(Vec::new());
            return;
        }

        let impulse = self.impulse.clone().unwrap_or_default();
        for controller in self.controllers.values() {
            if let Err(e) = controller.attach_playback(&self.config, &impulse, self.settings) {
                tracing::warn!(sender = %controller.sender_id(), error = %e, "Failed to build audio graph");
            }
        }
        self.mixer.set_outputs(
            self.controllers
                .values()
                .filter(|c| c.is_playing())
                .map(|c| c.output())
                .collect(),
        );
    }

    fn update(&mut self, settings: MixSettings) {
        self.settings = settings;
        for controller in self.controllers.values() {
            controller.apply_settings(settings);
        }
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.update(MixSettings {
            muted,
            ..self.settings
        });
    }

    pub fn toggle_mute(&mut self) {
        self.set_muted(!self.settings.muted);
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.update(MixSettings {
            volume: volume.clamp(0.0, 1.0),
            ..self.settings
        });
    }

    pub fn set_effect_enabled(&mut self, effect_enabled: bool) {
        self.update(MixSettings {
            effect_enabled,
            ..self.settings
        });
    }

    pub fn set_effect_intensity(&mut self, intensity: f32) {
        self.update(MixSettings {
            effect_intensity: intensity.clamp(0.0, 1.0),
            ..self.settings
        });
    }

    pub fn header(&self) -> String {
        match self.sources.len() {
            0 => "No Mics".to_string(),
            n => format!("{n} Mic(s) Live"),
        }
    }

    pub fn rows(&self) -> Vec<MicRow> {
        self.sources
            .iter()
            .map(|source| {
                let status = self
                    .controllers
                    .get(&source.sender_id)
                    .map(|c| c.status())
                    .unwrap_or_default();
                MicRow {
                    sender_id: source.sender_id.clone(),
                    short_id: short_id(&source.sender_id).to_string(),
                    level: (status.level / 255.0).clamp(0.0, 1.0),
                    hot: status.level >= self.config.silence_threshold,
                    round_trip: status.round_trip,
                    closing_in: status.countdown,
                }
            })
            .collect()
    }

    pub fn snapshot(&self) -> PanelSnapshot {
        PanelSnapshot {
            header: self.header(),
            needs_enable_prompt: self.needs_enable_prompt(),
            settings: self.settings,
            rows: self.rows(),
        }
    }

    pub fn apply(&mut self, command: PanelCommand) {
        match command {
            PanelCommand::EnableAudio => self.enable_audio(),
            PanelCommand::PlaybackFailed => self.playback_failed(),
            PanelCommand::SetMuted(muted) => self.set_muted(muted),
            PanelCommand::ToggleMute => self.toggle_mute(),
            PanelCommand::SetVolume(volume) => self.set_volume(volume),
            PanelCommand::SetEffectEnabled(enabled) => self.set_effect_enabled(enabled),
            PanelCommand::SetEffectIntensity(intensity) => self.set_effect_intensity(intensity),
            PanelCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Follow the receiver's live sources and apply commands until either side closes.
    pub async fn run(
        mut self,
        mut sources: watch::Receiver<Vec<LiveSource>>,
        mut commands: mpsc::Receiver<PanelCommand>,
    ) {
        let initial = sources.borrow_and_update().clone();
        self.sync_sources(initial);

        loop {
            tokio::select! {
                changed = sources.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let latest = sources.borrow_and_update().clone();
                    self.sync_sources(latest);
                }
                command = commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
            }
        }

        self.controllers.clear();
        tracing::info!("Mic panel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaStream;
    use crate::testing::FakePeer;
    use crate::transport::{PeerConnection, PeerEventSink};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopCloser;

    impl SessionCloser for NoopCloser {
        fn force_close(&self, _source: &LiveSource) {}
    }

    #[derive(Default)]
    struct CountingCloser(AtomicUsize);

    impl SessionCloser for CountingCloser {
        fn force_close(&self, _source: &LiveSource) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn panel() -> MicPanel {
        let config = MicConfig {
            reverb_seconds: 0.05,
            ..MicConfig::default()
        };
        MicPanel::new(config, Arc::new(NoopCloser))
    }

    fn source(id: &str, generation: u64) -> LiveSource {
        let peer: Arc<dyn PeerConnection> =
            Arc::new(FakePeer::new(PeerEventSink::new(|_| {})));
        LiveSource {
            sender_id: id.to_string(),
            generation,
            stream: MediaStream::new(id),
            peer,
        }
    }

    #[tokio::test]
    async fn test_no_audio_until_enabled() {
        let mut panel = panel();
        assert_eq!(panel.header(), "No Mics");
        assert!(!panel.needs_enable_prompt());

        panel.sync_sources(vec![source("aaaa-1", 1), source("bbbb-2", 2)]);
        assert_eq!(panel.header(), "2 Mic(s) Live");
        assert!(panel.needs_enable_prompt());
        assert_eq!(panel.controller_count(), 2);
        assert_eq!(panel.playing_count(), 0);
        assert_eq!(panel.mixer().source_count(), 0);

        panel.enable_audio();
        assert_eq!(panel.lifecycle(), AudioLifecycle::Armed);
        assert!(!panel.needs_enable_prompt());
        assert_eq!(panel.playing_count(), 2);
        assert_eq!(panel.mixer().source_count(), 2);
    }

    #[tokio::test]
    async fn test_sources_reconciled() {
        let mut panel = panel();
        panel.enable_audio();
        panel.sync_sources(vec![source("A", 1), source("B", 2)]);
        assert_eq!(panel.controller_count(), 2);

        panel.sync_sources(vec![source("B", 2)]);
        assert_eq!(panel.controller_count(), 1);
        assert_eq!(panel.header(), "1 Mic(s) Live");

        // Same sender, new session: the controller is rebuilt.
        panel.sync_sources(vec![source("B", 5)]);
        assert_eq!(panel.controller_count(), 1);
        assert_eq!(panel.controllers["B"].generation(), 5);
    }

    #[tokio::test]
    async fn test_playback_failure_rearms_prompt() {
        let mut panel = panel();
        panel.sync_sources(vec![source("A", 1)]);
        panel.enable_audio();
        panel.playback_failed();

        assert_eq!(panel.lifecycle(), AudioLifecycle::Unarmed);
        assert!(panel.needs_enable_prompt());
        assert_eq!(panel.controller_count(), 1);
        assert_eq!(panel.playing_count(), 0);
        assert_eq!(panel.mixer().source_count(), 0);

        panel.enable_audio();
        assert_eq!(panel.playing_count(), 1);
        assert_eq!(panel.mixer().source_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_mic_closed_while_unarmed() {
        let closer = Arc::new(CountingCloser::default());
        let config = MicConfig {
            silence_timeout: Duration::from_secs(2),
            reverb_seconds: 0.05,
            ..MicConfig::default()
        };
        let mut panel = MicPanel::new(config, closer.clone());
        panel.sync_sources(vec![source("A", 1)]);
        assert_eq!(panel.lifecycle(), AudioLifecycle::Unarmed);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(closer.0.load(Ordering::SeqCst), 1);
        assert_eq!(panel.playing_count(), 0);
    }

    #[tokio::test]
    async fn test_settings_reach_every_controller() {
        let mut panel = panel();
        panel.sync_sources(vec![source("A", 1), source("B", 2)]);
        panel.enable_audio();

        panel.set_effect_enabled(true);
        assert!(panel.controllers.values().all(|c| c.wet_connected()));

        panel.toggle_mute();
        assert!(panel.settings().muted);
        assert!(panel.controllers.values().all(|c| !c.wet_connected()));

        panel.set_volume(1.7);
        panel.set_effect_intensity(-0.2);
        assert_eq!(panel.settings().volume, 1.0);
        assert_eq!(panel.settings().effect_intensity, 0.0);
    }

    #[tokio::test]
    async fn test_rows_show_short_ids_and_unknown_rtt() {
        let mut panel = panel();
        panel.sync_sources(vec![source("0192f3a4-77", 1)]);

        let rows = panel.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].short_id, "0192");
        assert_eq!(rows[0].round_trip, RoundTrip::Unknown);
        assert!(!rows[0].hot);
        assert!(rows[0].to_string().contains("--"));
    }

    #[test]
    fn test_row_countdown_display() {
        let row = MicRow {
            sender_id: "abcdef".into(),
            short_id: "abcd".into(),
            level: 0.5,
            hot: true,
            round_trip: RoundTrip::Measured(Duration::from_millis(42)),
            closing_in: Some(Duration::from_secs(12)),
        };
        let text = row.to_string();
        assert!(text.starts_with("abcd ["));
        assert!(text.contains("42ms"));
        assert!(text.ends_with("Closing in 12s"));
    }

    #[test]
    fn test_mixer_sums_and_clamps() {
        let mixer = Mixer::default();
        let a = MediaStream::new("a");
        let b = MediaStream::new("b");
        a.push(&[0.25, 0.75, 0.5]);
        b.push(&[0.25, 0.75]);
        mixer.set_outputs(vec![a, b]);

        let mut out = [9.0; 4];
        mixer.render(&mut out);
        assert_eq!(out, [0.5, 1.0, 0.5, 0.0]);
    }

    #[tokio::test]
    async fn test_run_follows_sources_and_commands() {
        let panel = panel();
        let (sources_tx, sources_rx) = watch::channel(Vec::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let task = tokio::spawn(panel.run(sources_rx, cmd_rx));

        sources_tx.send_replace(vec![source("A", 1)]);
        tokio::task::yield_now().await;
        cmd_tx.send(PanelCommand::EnableAudio).await.unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx.send(PanelCommand::Snapshot(reply_tx)).await.unwrap();
        let snapshot = reply_rx.await.unwrap();
        assert_eq!(snapshot.header, "1 Mic(s) Live");
        assert!(!snapshot.needs_enable_prompt);
        assert_eq!(snapshot.rows.len(), 1);

        drop(cmd_tx);
        task.await.unwrap();
    }
}
