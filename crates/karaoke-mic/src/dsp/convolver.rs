//! Reverb by uniformly partitioned FFT convolution (overlap-save).
//!
//! The impulse response is split into `block`-sized partitions, each pre-transformed at
//! size `2 * block`. Input is consumed one block at a time; its spectrum is pushed into a
//! frequency-domain delay line and multiplied against every partition. The wet path
//! therefore carries `block` samples of latency; the dry path carries none.

use crate::error::GraphError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::collections::VecDeque;
use std::sync::Arc;

pub const DEFAULT_BLOCK: usize = 512;

/// Generate a decaying-noise room impulse, normalised to roughly unity loudness.
pub fn reverb_impulse(sample_rate: u32, seconds: f32, decay: f32, seed: u64) -> Vec<f32> {
    let len = (sample_rate as f32 * seconds.max(0.0)) as usize;
    if len == 0 {
        return Vec::new();
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut impulse: Vec<f32> = (0..len)
        .map(|i| {
            let envelope = (1.0 - i as f32 / len as f32).powf(decay);
            rng.random_range(-1.0f32..=1.0) * envelope
        })
        .collect();

    let power = (impulse.iter().map(|s| s * s).sum::<f32>() / len as f32).sqrt();
    if power > 0.0 {
        // -58 dB calibration keeps the wet signal close to the dry level.
        let scale = 0.00125 / power * (44_100.0 / sample_rate as f32);
        impulse.iter_mut().for_each(|s| *s *= scale);
    }
    impulse
}

pub struct Convolver {
    block: usize,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    partitions: Vec<Vec<Complex<f32>>>,
    delay_line: Vec<Vec<Complex<f32>>>,
    delay_pos: usize,
    window: Vec<f32>,
    block_fill: usize,
    spectrum: Vec<Complex<f32>>,
    accum: Vec<Complex<f32>>,
    output: VecDeque<f32>,
}

impl Convolver {
    pub fn new(impulse: &[f32], block: usize) -> Result<Self, GraphError> {
        if block == 0 {
            return Err(GraphError::InvalidBlockSize);
        }

        let size = 2 * block;
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        let ifft = planner.plan_fft_inverse(size);

        let partitions: Vec<Vec<Complex<f32>>> = impulse
            .chunks(block)
            .map(|chunk| {
                let mut buf = vec![Complex::default(); size];
                for (slot, &h) in buf.iter_mut().zip(chunk) {
                    *slot = Complex::new(h, 0.0);
                }
                fft.process(&mut buf);
                buf
            })
            .collect();
        let delay_line = vec![vec![Complex::default(); size]; partitions.len().max(1)];

        Ok(Self {
            block,
            fft,
            ifft,
            partitions,
            delay_line,
            delay_pos: 0,
            window: vec![0.0; size],
            block_fill: 0,
            spectrum: vec![Complex::default(); size],
            accum: vec![Complex::default(); size],
            output: std::iter::repeat_n(0.0, block).collect(),
        })
    }

    /// Convolve `input` into `output` (overwriting it). Lengths must match.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        for (x, y) in input.iter().zip(output.iter_mut()) {
            self.window[self.block + self.block_fill] = *x;
            self.block_fill += 1;
            if self.block_fill == self.block {
                self.process_block();
                self.block_fill = 0;
            }
            *y = self.output.pop_front().unwrap_or(0.0);
        }
    }

    fn process_block(&mut self) {
        let size = 2 * self.block;
        for (slot, &s) in self.spectrum.iter_mut().zip(&self.window) {
            *slot = Complex::new(s, 0.0);
        }
        self.fft.process(&mut self.spectrum);
        self.delay_line[self.delay_pos].copy_from_slice(&self.spectrum);

        self.accum.iter_mut().for_each(|c| *c = Complex::default());
        let slots = self.delay_line.len();
        for (p, partition) in self.partitions.iter().enumerate() {
            let input = &self.delay_line[(self.delay_pos + slots - p) % slots];
            for ((acc, x), h) in self.accum.iter_mut().zip(input).zip(partition) {
                *acc += x * h;
            }
        }
        self.ifft.process(&mut self.accum);

        let scale = 1.0 / size as f32;
        self.output
            .extend(self.accum[self.block..].iter().map(|c| c.re * scale));

        self.window.copy_within(self.block.., 0);
        self.delay_pos = (self.delay_pos + 1) % slots;
    }
}
