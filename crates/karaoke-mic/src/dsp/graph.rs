//! One live stream's playback graph.
//!
//! ```text
//!  input ────┬──► dry gain ──────────────────┐
//!            └──► reverb ──► wet gain ─ ─ ─ ─┴──► output
//!                             (wet edge)
//! ```
//!
//! The wet edge into the output is a small state machine. It is attached only while
//! the effect is audible; detaching first fades the wet gain to zero (`Releasing`) and
//! the edge is physically removed once the fade has finished. [`AudioGraph::apply_settings`]
//! is the only place that attaches or detaches it, and it only does so on a real
//! transition, so the output never receives the wet signal twice.

use super::convolver::{Convolver, DEFAULT_BLOCK};
use super::gain::SmoothedGain;
use crate::MicConfig;
use crate::error::GraphError;
use crate::media::SAMPLE_RATE;

/// Wet gain below which a releasing edge is detached.
const SILENT_GAIN: f32 = 1e-4;

/// User-facing mix controls, applied uniformly to every live stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixSettings {
    pub muted: bool,
    /// `0.0..=1.0`
    pub volume: f32,
    pub effect_enabled: bool,
    /// `0.0..=1.0`
    pub effect_intensity: f32,
}

impl Default for MixSettings {
    fn default() -> Self {
        Self {
            muted: false,
            volume: 1.0,
            effect_enabled: false,
            effect_intensity: 0.5,
        }
    }
}

impl MixSettings {
    /// Whether the wet path should be audible.
    pub fn wet_wanted(&self) -> bool {
        !self.muted && self.effect_enabled && self.effect_intensity > 0.0
    }

    pub fn dry_level(&self) -> f32 {
        if self.muted { 0.0 } else { self.volume }
    }

    pub fn wet_level(&self, wet_gain_factor: f32) -> f32 {
        self.volume * self.effect_intensity * wet_gain_factor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    Disconnected,
    Connected,
    /// Still attached, fading out.
    Releasing,
}

#[derive(Debug)]
struct WetEdge {
    state: EdgeState,
    /// Number of physical attachments to the output. Never more than one.
    attachments: u8,
}

impl WetEdge {
    fn new() -> Self {
        Self {
            state: EdgeState::Disconnected,
            attachments: 0,
        }
    }

    fn connect(&mut self) {
        match self.state {
            EdgeState::Disconnected => {
                self.attachments += 1;
                self.state = EdgeState::Connected;
            }
            EdgeState::Releasing => self.state = EdgeState::Connected,
            EdgeState::Connected => {}
        }
    }

    fn disconnect(&mut self) {
        if self.state == EdgeState::Connected {
            self.state = EdgeState::Releasing;
        }
    }

    fn finish_release(&mut self) {
        if self.state == EdgeState::Releasing {
            self.attachments -= 1;
            self.state = EdgeState::Disconnected;
        }
    }
}

pub struct AudioGraph {
    wet_gain_factor: f32,
    dry: SmoothedGain,
    wet: SmoothedGain,
    reverb: Convolver,
    edge: WetEdge,
    wet_scratch: Vec<f32>,
}

impl AudioGraph {
    pub fn new(
        config: &MicConfig,
        impulse: &[f32],
        settings: MixSettings,
    ) -> Result<Self, GraphError> {
        let ramp = config.ramp_time_constant;
        let mut graph = Self {
            wet_gain_factor: config.wet_gain_factor,
            dry: SmoothedGain::new(settings.dry_level(), ramp, SAMPLE_RATE),
            wet: SmoothedGain::new(0.0, ramp, SAMPLE_RATE),
            reverb: Convolver::new(impulse, DEFAULT_BLOCK)?,
            edge: WetEdge::new(),
            wet_scratch: Vec::new(),
        };
        graph.apply_settings(settings);
        Ok(graph)
    }

    pub fn apply_settings(&mut self, settings: MixSettings) {
        self.dry.set_target(settings.dry_level());

        if settings.wet_wanted() {
            self.edge.connect();
            self.wet.set_target(settings.wet_level(self.wet_gain_factor));
        } else if self.edge.state == EdgeState::Connected {
            self.wet.set_target(0.0);
            self.edge.disconnect();
        }
    }

    /// True only while the wet path is attached and audible.
    pub fn wet_connected(&self) -> bool {
        self.edge.state == EdgeState::Connected
    }

    pub fn edge_state(&self) -> EdgeState {
        self.edge.state
    }

    pub fn wet_attachments(&self) -> u8 {
        self.edge.attachments
    }

    /// Process `input` and mix the result into `output`.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        for (x, y) in input.iter().zip(output.iter_mut()) {
            *y += x * self.dry.next_gain();
        }

        if self.edge.state == EdgeState::Disconnected {
            return;
        }

        self.wet_scratch.resize(input.len(), 0.0);
        self.reverb.process(input, &mut self.wet_scratch);
        for (w, y) in self.wet_scratch.iter().zip(output.iter_mut()) {
            *y += w * self.wet.next_gain();
        }

        if self.edge.state == EdgeState::Releasing && self.wet.current() < SILENT_GAIN {
            self.edge.finish_release();
        }
    }
}
