//! Stateful sample-rate conversion between audio devices and [`SAMPLE_RATE`].
//!
//! cpal hands out blocks whose size has nothing to do with a resampler's chunk size.
//! Both converters keep leftover input or output between calls, so the signal stays
//! continuous across block boundaries and a pulled source is drained at exactly its
//! nominal rate.
//!
//! [`SAMPLE_RATE`]: crate::media::SAMPLE_RATE

use rubato::{
    FftFixedIn, FftFixedOut, ResampleError, Resampler, ResamplerConstructionError,
};
use std::collections::VecDeque;

/// Capture chunk size, in device frames.
const CAPTURE_CHUNK: usize = 480;

/// Playback chunk size, in device frames.
const PLAYBACK_CHUNK: usize = 256;

/// Push side: device-rate blocks in, converted mono out.
pub struct CaptureResampler {
    resampler: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
    chunk_in: Vec<Vec<f32>>,
    chunk_out: Vec<Vec<f32>>,
}

impl CaptureResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self, ResamplerConstructionError> {
        let resampler = if source_rate == target_rate {
            None
        } else {
            Some(FftFixedIn::<f32>::new(
                source_rate as usize,
                target_rate as usize,
                CAPTURE_CHUNK,
                2,
                1,
            )?)
        };
        let (chunk_in, chunk_out) = match &resampler {
            Some(r) => (r.input_buffer_allocate(true), r.output_buffer_allocate(true)),
            None => (Vec::new(), Vec::new()),
        };
        Ok(Self {
            resampler,
            pending: Vec::with_capacity(CAPTURE_CHUNK * 4),
            chunk_in,
            chunk_out,
        })
    }

    /// Append the converted form of `input` to `out`. A partial chunk waits for the
    /// next call.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<(), ResampleError> {
        let Some(resampler) = self.resampler.as_mut() else {
            out.extend_from_slice(input);
            return Ok(());
        };

        self.pending.extend_from_slice(input);
        let mut offset = 0;
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() - offset < needed {
                break;
            }
            self.chunk_in[0][..needed].copy_from_slice(&self.pending[offset..offset + needed]);
            let (used, written) =
                resampler.process_into_buffer(&self.chunk_in, &mut self.chunk_out, None)?;
            out.extend_from_slice(&self.chunk_out[0][..written]);
            offset += used;
        }
        self.pending.drain(..offset);
        Ok(())
    }
}

/// Pull side: the device asks for a block, the source is rendered at its own rate.
pub struct PlaybackResampler {
    resampler: Option<FftFixedOut<f32>>,
    chunk_in: Vec<Vec<f32>>,
    chunk_out: Vec<Vec<f32>>,
    ready: VecDeque<f32>,
}

impl PlaybackResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self, ResamplerConstructionError> {
        let resampler = if source_rate == target_rate {
            None
        } else {
            Some(FftFixedOut::<f32>::new(
                source_rate as usize,
                target_rate as usize,
                PLAYBACK_CHUNK,
                2,
                1,
            )?)
        };
        let (chunk_in, chunk_out) = match &resampler {
            Some(r) => (r.input_buffer_allocate(true), r.output_buffer_allocate(true)),
            None => (Vec::new(), Vec::new()),
        };
        Ok(Self {
            resampler,
            chunk_in,
            chunk_out,
            ready: VecDeque::with_capacity(PLAYBACK_CHUNK * 8),
        })
    }

    /// Fill `out` at the target rate. `source` is asked for exactly as many source-rate
    /// samples as the conversion needs; converted samples left over stay queued.
    pub fn fill<F>(&mut self, out: &mut [f32], mut source: F) -> Result<(), ResampleError>
    where
        F: FnMut(&mut [f32]),
    {
        let Some(resampler) = self.resampler.as_mut() else {
            source(out);
            return Ok(());
        };

        while self.ready.len() < out.len() {
            let needed = resampler.input_frames_next();
            let block = &mut self.chunk_in[0][..needed];
            block.fill(0.0);
            source(block);
            let (_, written) =
                resampler.process_into_buffer(&self.chunk_in, &mut self.chunk_out, None)?;
            self.ready.extend(self.chunk_out[0][..written].iter().copied());
        }
        let n = out.len();
        for (slot, sample) in out.iter_mut().zip(self.ready.drain(..n)) {
            *slot = sample;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_rates_pass_through() {
        let mut capture = CaptureResampler::new(48_000, 48_000).unwrap();
        let mut out = Vec::new();
        capture.process(&[0.1, 0.2, 0.3], &mut out).unwrap();
        assert_eq!(out, vec![0.1, 0.2, 0.3]);

        let mut playback = PlaybackResampler::new(48_000, 48_000).unwrap();
        let mut block = [0.0; 4];
        playback.fill(&mut block, |buf| buf.fill(0.5)).unwrap();
        assert_eq!(block, [0.5; 4]);
    }

    #[test]
    fn test_capture_keeps_rate_and_level_across_blocks() {
        let mut capture = CaptureResampler::new(44_100, 48_000).unwrap();
        let block = vec![0.25_f32; 512];
        let mut out = Vec::new();

        let mut fed = 0;
        while fed < 44_100 {
            capture.process(&block, &mut out).unwrap();
            fed += block.len();
        }

        let expected = fed * 48_000 / 44_100;
        assert!(out.len() <= expected, "produced {} > {expected}", out.len());
        assert!(out.len() + 2 * 1_024 > expected, "produced {} of {expected}", out.len());

        let settled = &out[out.len() / 2..];
        assert!(settled.iter().all(|s| (s - 0.25).abs() < 0.01));
    }

    #[test]
    fn test_playback_drains_source_at_nominal_rate() {
        let mut playback = PlaybackResampler::new(48_000, 44_100).unwrap();
        let mut consumed = 0_usize;
        let mut played = 0_usize;
        let mut block = vec![0.0; 512];

        // One minute of 512-frame device callbacks.
        while played < 60 * 44_100 {
            playback
                .fill(&mut block, |buf| {
                    buf.fill(0.0);
                    consumed += buf.len();
                })
                .unwrap();
            played += block.len();
        }

        let expected = (played as u64 * 48_000 / 44_100) as i64;
        let drift = consumed as i64 - expected;
        assert!(drift.abs() < 1_000, "consumed {consumed}, expected {expected}");
    }

    #[test]
    fn test_playback_is_continuous_across_callbacks() {
        let mut playback = PlaybackResampler::new(48_000, 44_100).unwrap();
        let step = 2.0 * std::f32::consts::PI * 440.0 / 48_000.0;
        let mut phase = 0_usize;
        let mut output = Vec::new();
        let mut block = vec![0.0; 512];

        for _ in 0..40 {
            playback
                .fill(&mut block, |buf| {
                    for slot in buf.iter_mut() {
                        *slot = 0.5 * (phase as f32 * step).sin();
                        phase += 1;
                    }
                })
                .unwrap();
            output.extend_from_slice(&block);
        }

        // Largest step of a 0.5 amplitude 440 Hz sine at 44.1 kHz is about 0.031.
        let settled = &output[4_096..];
        let max_jump = settled
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0_f32, f32::max);
        assert!(max_jump < 0.05, "max jump {max_jump}");
    }
}
