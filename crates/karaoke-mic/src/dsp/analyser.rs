//! Frequency analysis for level metering and silence detection.
//!
//! Mirrors the byte frequency data of a Web Audio `AnalyserNode`: the most recent
//! `fft_size` samples are Blackman-windowed, transformed, smoothed over time, converted
//! to decibels and mapped from `[-100, -30]` dB onto `0..=255`.

use crate::error::GraphError;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

pub const MIN_DECIBELS: f32 = -100.0;
pub const MAX_DECIBELS: f32 = -30.0;
pub const SMOOTHING: f32 = 0.8;

pub struct Analyser {
    fft: Arc<dyn Fft<f32>>,
    size: usize,
    window: Vec<f32>,
    history: Vec<f32>,
    write_pos: usize,
    smoothed: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    bytes: Vec<u8>,
}

impl Analyser {
    pub fn new(fft_size: usize) -> Result<Self, GraphError> {
        if !fft_size.is_power_of_two() || !(32..=32_768).contains(&fft_size) {
            return Err(GraphError::InvalidFftSize(fft_size));
        }

        let fft = FftPlanner::new().plan_fft_forward(fft_size);
        let window = (0..fft_size)
            .map(|i| {
                let x = i as f32 / fft_size as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();

        Ok(Self {
            fft,
            size: fft_size,
            window,
            history: vec![0.0; fft_size],
            write_pos: 0,
            smoothed: vec![0.0; fft_size / 2],
            scratch: vec![Complex::default(); fft_size],
            bytes: vec![0; fft_size / 2],
        })
    }

    pub fn bin_count(&self) -> usize {
        self.size / 2
    }

    /// Feed time-domain samples.
    pub fn write(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.history[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % self.size;
        }
    }

    /// Compute byte frequency data for the current window.
    pub fn byte_frequency_data(&mut self) -> &[u8] {
        for i in 0..self.size {
            let sample = self.history[(self.write_pos + i) % self.size];
            self.scratch[i] = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let scale = 1.0 / self.size as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        for (bin, (smoothed, byte)) in self
            .smoothed
            .iter_mut()
            .zip(self.bytes.iter_mut())
            .enumerate()
        {
            let magnitude = self.scratch[bin].norm() * scale;
            *smoothed = SMOOTHING * *smoothed + (1.0 - SMOOTHING) * magnitude;
            let db = 20.0 * smoothed.log10();
            let scaled = 255.0 * (db - MIN_DECIBELS) / range;
            *byte = if scaled.is_nan() {
                0
            } else {
                scaled.clamp(0.0, 255.0) as u8
            };
        }
        &self.bytes
    }

    /// Mean of the byte frequency data, in `0.0..=255.0`.
    pub fn average_level(&mut self) -> f32 {
        let data = self.byte_frequency_data();
        if data.is_empty() {
            return 0.0;
        }
        data.iter().map(|&b| b as f32).sum::<f32>() / data.len() as f32
    }
}
