//! Per-source controller.
//!
//! A [`StreamController`] is created for every live source, armed or not. It runs two
//! background tasks:
//!
//! - processing: every analysis interval, pull decoded audio from the source, measure
//!   the level, and track silence. Crossing the silence timeout force-closes the
//!   session once. While a playback [`AudioGraph`] is attached, the same audio also
//!   goes through the graph into the controller's output stream.
//! - stats: every stats interval, refresh the round-trip time.
//!
//! Dropping the controller aborts both tasks and ends its output stream.

use crate::MicConfig;
use crate::dsp::{Analyser, AudioGraph, MixSettings};
use crate::error::GraphError;
use crate::media::{MediaStream, SAMPLE_RATE};
use crate::protocol::PeerId;
use crate::quality::{RoundTrip, poll_round_trip};
use crate::receiver::{LiveSource, SessionCloser};
use crate::silence::{SilenceTracker, SilenceVerdict};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Upper bound on how far one processing tick catches up, in analysis intervals.
const MAX_CATCH_UP: usize = 4;

/// Snapshot of a controller's meters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerStatus {
    /// Average byte-spectrum level, `0.0..=255.0`.
    pub level: f32,
    pub silence: Duration,
    /// Remaining time before the automatic close, once the warning has started.
    pub countdown: Option<Duration>,
    pub round_trip: RoundTrip,
    pub timed_out: bool,
}

pub struct StreamController {
    source: LiveSource,
    playback: Arc<Mutex<Option<AudioGraph>>>,
    status: Arc<Mutex<ControllerStatus>>,
    output: MediaStream,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamController {
    /// Start metering the source. Nothing is spawned if the analyser cannot be built.
    pub fn spawn(
        source: LiveSource,
        config: &MicConfig,
        closer: Arc<dyn SessionCloser>,
    ) -> Result<Self, GraphError> {
        let meter = Analyser::new(config.fft_size)?;
        let playback = Arc::new(Mutex::new(None));
        let status = Arc::new(Mutex::new(ControllerStatus::default()));
        let output = MediaStream::with_capacity(
            format!("{}-out", source.sender_id),
            SAMPLE_RATE as usize / 5,
        );

        let processing = tokio::spawn(process_loop(ProcessLoop {
            source: source.clone(),
            meter,
            playback: playback.clone(),
            status: status.clone(),
            output: output.clone(),
            tracker: SilenceTracker::new(config.silence_threshold, config.silence_timeout),
            warn_after: config.silence_warn,
            interval: config.analysis_interval,
            closer,
        }));
        let stats = tokio::spawn(stats_loop(
            source.peer.clone(),
            status.clone(),
            config.stats_interval,
        ));

        tracing::debug!(sender = %source.sender_id, "Stream controller started");
        Ok(Self {
            source,
            playback,
            status,
            output,
            tasks: vec![processing, stats],
        })
    }

    pub fn sender_id(&self) -> &PeerId {
        &self.source.sender_id
    }

    pub fn generation(&self) -> u64 {
        self.source.generation
    }

    pub fn status(&self) -> ControllerStatus {
        self.status.lock().clone()
    }

    /// Processed audio, ready for the mixer.
    pub fn output(&self) -> MediaStream {
        self.output.clone()
    }

    /// Build the playback graph. Does nothing if one is already attached.
    pub fn attach_playback(
        &self,
        config: &MicConfig,
        impulse: &[f32],
        settings: MixSettings,
    ) -> Result<(), GraphError> {
        if self.is_playing() {
            return Ok(());
        }
        let graph = AudioGraph::new(config, impulse, settings)?;
        let mut playback = self.playback.lock();
        if playback.is_none() {
            *playback = Some(graph);
            tracing::debug!(sender = %self.source.sender_id, "Playback attached");
        }
        Ok(())
    }

    /// Drop the playback graph and anything it had queued. Metering keeps running.
    pub fn detach_playback(&self) {
        if self.playback.lock().take().is_some() {
            self.output.clear();
            tracing::debug!(sender = %self.source.sender_id, "Playback detached");
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playback.lock().is_some()
    }

    pub fn apply_settings(&self, settings: MixSettings) {
        if let Some(graph) = self.playback.lock().as_mut() {
            graph.apply_settings(settings);
        }
    }

    pub fn wet_connected(&self) -> bool {
        self.playback
            .lock()
            .as_ref()
            .is_some_and(|graph| graph.wet_connected())
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.output.end();
        tracing::debug!(sender = %self.source.sender_id, "Stream controller stopped");
    }
}

struct ProcessLoop {
    source: LiveSource,
    meter: Analyser,
    playback: Arc<Mutex<Option<AudioGraph>>>,
    status: Arc<Mutex<ControllerStatus>>,
    output: MediaStream,
    tracker: SilenceTracker,
    warn_after: Duration,
    interval: Duration,
    closer: Arc<dyn SessionCloser>,
}

async fn process_loop(mut state: ProcessLoop) {
    let frames = ((SAMPLE_RATE as f64 * state.interval.as_secs_f64()).round() as usize).max(1);
    let mut input = vec![0.0f32; frames * MAX_CATCH_UP];
    let mut mixed = vec![0.0f32; frames * MAX_CATCH_UP];

    let mut ticker = tokio::time::interval(state.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        // Short reads are padded with silence, the same as a starved source.
        let n = state
            .source
            .stream
            .buffered()
            .clamp(frames, frames * MAX_CATCH_UP);
        input[..n].fill(0.0);
        state.source.stream.read(&mut input[..n]);
        state.meter.write(&input[..n]);
        let level = state.meter.average_level();

        let playing = match state.playback.lock().as_mut() {
            Some(graph) => {
                mixed[..n].fill(0.0);
                graph.process(&input[..n], &mut mixed[..n]);
                true
            }
            None => false,
        };
        if playing {
            state.output.push(&mixed[..n]);
        }

        let verdict = state.tracker.observe(level, Instant::now());
        {
            let mut status = state.status.lock();
            status.level = level;
            status.silence = state.tracker.elapsed();
            status.countdown = state.tracker.countdown(state.warn_after);
            if verdict == SilenceVerdict::TimedOut {
                status.timed_out = true;
            }
        }

        if verdict == SilenceVerdict::TimedOut {
            tracing::info!(
                sender = %state.source.sender_id,
                silence_secs = state.tracker.elapsed().as_secs_f64(),
                "Closing silent mic"
            );
            state.closer.force_close(&state.source);
        }
    }
}

async fn stats_loop(
    peer: Arc<dyn crate::transport::PeerConnection>,
    status: Arc<Mutex<ControllerStatus>>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut round_trip = RoundTrip::Unknown;

    loop {
        ticker.tick().await;
        round_trip = poll_round_trip(peer.as_ref(), round_trip).await;
        status.lock().round_trip = round_trip;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePeer;
    use crate::transport::{CandidatePairState, PeerConnection, PeerEventSink, StatsReport};
    use std::f32::consts::PI;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingCloser(AtomicUsize);

    impl CountingCloser {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl SessionCloser for CountingCloser {
        fn force_close(&self, _source: &LiveSource) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn source(id: &str) -> (LiveSource, Arc<FakePeer>) {
        let fake = Arc::new(FakePeer::new(PeerEventSink::new(|_| {})));
        let peer: Arc<dyn PeerConnection> = fake.clone();
        let source = LiveSource {
            sender_id: id.to_string(),
            generation: 1,
            stream: MediaStream::new(id),
            peer,
        };
        (source, fake)
    }

    fn config() -> MicConfig {
        MicConfig {
            silence_timeout: Duration::from_secs(2),
            ..MicConfig::default()
        }
    }

    fn tone(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (2.0 * PI * 440.0 * i as f32 / SAMPLE_RATE as f32).sin())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_source_closed_exactly_once() {
        let closer = Arc::new(CountingCloser::default());
        let (src, _) = source("A");
        let controller = StreamController::spawn(src, &config(), closer.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(closer.count(), 0);
        assert!(controller.status().countdown.is_none());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(closer.count(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(closer.count(), 1);
        assert!(controller.status().timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sound_keeps_source_open() {
        let closer = Arc::new(CountingCloser::default());
        let (src, _) = source("A");
        let stream = src.stream.clone();
        let controller = StreamController::spawn(src, &config(), closer.clone()).unwrap();
        controller
            .attach_playback(&config(), &[], MixSettings::default())
            .unwrap();

        let chunk = tone(768);
        for _ in 0..300 {
            stream.push(&chunk);
            tokio::time::sleep(Duration::from_millis(16)).await;
        }
        assert_eq!(closer.count(), 0);
        assert!(controller.status().level > 10.0);
        assert!(controller.output().buffered() > 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(closer.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_refreshed_from_stats() {
        let closer = Arc::new(CountingCloser::default());
        let (src, fake) = source("A");
        *fake.stats.lock() = Ok(vec![StatsReport::CandidatePair {
            state: CandidatePairState::Succeeded,
            current_round_trip_time: Some(0.05),
        }]);
        let controller = StreamController::spawn(src, &MicConfig::default(), closer).unwrap();

        assert_eq!(controller.status().round_trip, RoundTrip::Unknown);
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(
            controller.status().round_trip,
            RoundTrip::Measured(Duration::from_millis(50))
        );

        *fake.stats.lock() = Err(());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            controller.status().round_trip,
            RoundTrip::Measured(Duration::from_millis(50))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_tasks() {
        let closer = Arc::new(CountingCloser::default());
        let (src, _) = source("A");
        let controller = StreamController::spawn(src, &config(), closer.clone()).unwrap();
        let output = controller.output();
        drop(controller);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(closer.count(), 0);
        assert!(output.is_ended());
    }

    #[tokio::test]
    async fn test_invalid_fft_size_spawns_nothing() {
        let closer = Arc::new(CountingCloser::default());
        let (src, _) = source("A");
        let config = MicConfig {
            fft_size: 100,
            ..MicConfig::default()
        };
        let result = StreamController::spawn(src, &config, closer);
        assert!(matches!(result, Err(GraphError::InvalidFftSize(100))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_meters_without_playback_graph() {
        let closer = Arc::new(CountingCloser::default());
        let (src, _) = source("A");
        let stream = src.stream.clone();
        let controller = StreamController::spawn(src, &config(), closer.clone()).unwrap();
        assert!(!controller.is_playing());

        let chunk = tone(768);
        for _ in 0..60 {
            stream.push(&chunk);
            tokio::time::sleep(Duration::from_millis(16)).await;
        }
        assert!(controller.status().level > 10.0);
        assert_eq!(controller.output().buffered(), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(closer.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_drops_queued_output() {
        let closer = Arc::new(CountingCloser::default());
        let (src, _) = source("A");
        let stream = src.stream.clone();
        let controller = StreamController::spawn(src, &config(), closer).unwrap();
        controller
            .attach_playback(
                &config(),
                &[],
                MixSettings {
                    effect_enabled: true,
                    ..MixSettings::default()
                },
            )
            .unwrap();
        assert!(controller.wet_connected());

        stream.push(&tone(4_800));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(controller.output().buffered() > 0);

        controller.detach_playback();
        assert!(!controller.is_playing());
        assert!(!controller.wet_connected());
        assert_eq!(controller.output().buffered(), 0);
        assert!(!controller.output().is_ended());
    }
}
