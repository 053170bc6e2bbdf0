//! Per-stream audio processing: gain smoothing, level analysis, and reverb.

pub mod analyser;
pub mod convolver;
pub mod gain;
pub mod graph;

pub use analyser::Analyser;
pub use convolver::{Convolver, reverb_impulse};
pub use gain::SmoothedGain;
pub use graph::{AudioGraph, EdgeState, MixSettings};
