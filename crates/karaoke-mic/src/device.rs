//! Audio devices on cpal: microphone capture for senders, speaker playback for the host.
//!
//! `cpal::Stream` is not `Send`, so each stream is built and kept alive on its own
//! thread; the async side only holds a stop channel.

use crate::error::MicError;
use crate::media::{MediaStream, SAMPLE_RATE};
use crate::panel::Mixer;
use crate::resample::{CaptureResampler, PlaybackResampler};
use crate::transport::{CaptureDevice, CaptureStream};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use nnnoiseless::{DenoiseState, FRAME_SIZE};
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::oneshot;

/// RNNoise works on 16-bit sample magnitudes.
const I16_SCALE: f32 = i16::MAX as f32;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("No audio device available")]
    NoDevice,

    #[error("Failed to query default stream config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("Failed to build audio stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("Failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("Failed to set up resampler: {0}")]
    Resampler(#[from] rubato::ResamplerConstructionError),

    #[error("Unsupported sample format {0}")]
    UnsupportedFormat(cpal::SampleFormat),

    #[error("Audio thread failed: {0}")]
    Thread(String),
}

/// Callback for asynchronous device errors.
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Real-time noise suppression (RNNoise) over 48 kHz mono.
pub struct NoiseSuppressor {
    state: Box<DenoiseState<'static>>,
    pending: Vec<f32>,
    frame_out: Vec<f32>,
}

impl NoiseSuppressor {
    pub fn new() -> Self {
        Self {
            state: DenoiseState::new(),
            pending: Vec::with_capacity(FRAME_SIZE * 2),
            frame_out: vec![0.0; FRAME_SIZE],
        }
    }

    /// Feed samples; denoised audio is appended to `out` one whole frame at a time.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        self.pending
            .extend(input.iter().map(|s| (s * I16_SCALE).clamp(-I16_SCALE, I16_SCALE)));
        while self.pending.len() >= FRAME_SIZE {
            self.state
                .process_frame(&mut self.frame_out, &self.pending[..FRAME_SIZE]);
            self.pending.drain(..FRAME_SIZE);
            out.extend(self.frame_out.iter().map(|s| s / I16_SCALE));
        }
    }
}

impl Default for NoiseSuppressor {
    fn default() -> Self {
        Self::new()
    }
}

/// The system default microphone.
pub struct CpalCapture {
    noise_suppression: bool,
}

impl CpalCapture {
    pub fn new(noise_suppression: bool) -> Self {
        Self { noise_suppression }
    }
}

#[async_trait]
impl CaptureDevice for CpalCapture {
    async fn open(&self) -> Result<Box<dyn CaptureStream>, MicError> {
        let stream = MediaStream::new("local-mic");
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), DeviceError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let worker_stream = stream.clone();
        let noise_suppression = self.noise_suppression;
        thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                let input = match start_input(worker_stream, noise_suppression) {
                    Ok(input) => input,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns on stop or when the handle is dropped.
                let _ = stop_rx.recv();
                drop(input);
            })
            .map_err(|e| MicError::DeviceUnavailable(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                tracing::info!(noise_suppression, "Microphone opened");
                Ok(Box::new(CpalCaptureStream {
                    stream,
                    stop_tx: Some(stop_tx),
                }))
            }
            Ok(Err(e)) => Err(MicError::DeviceUnavailable(e.to_string())),
            Err(_) => Err(MicError::DeviceUnavailable(
                "capture thread exited during setup".into(),
            )),
        }
    }
}

struct CpalCaptureStream {
    stream: MediaStream,
    stop_tx: Option<std_mpsc::Sender<()>>,
}

impl CaptureStream for CpalCaptureStream {
    fn stream(&self) -> MediaStream {
        self.stream.clone()
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
            self.stream.end();
            tracing::info!("Microphone released");
        }
    }
}

impl Drop for CpalCaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn start_input(stream: MediaStream, noise_suppression: bool) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(DeviceError::NoDevice)?;
    let supported = device.default_input_config()?;
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    let input = match format {
        cpal::SampleFormat::F32 => build_input::<f32>(&device, &config, stream, noise_suppression)?,
        cpal::SampleFormat::I16 => build_input::<i16>(&device, &config, stream, noise_suppression)?,
        cpal::SampleFormat::U16 => build_input::<u16>(&device, &config, stream, noise_suppression)?,
        other => return Err(DeviceError::UnsupportedFormat(other)),
    };
    input.play()?;
    Ok(input)
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    stream: MediaStream,
    noise_suppression: bool,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels;
    let mut resampler = CaptureResampler::new(config.sample_rate.0, SAMPLE_RATE)?;
    let mut suppressor = noise_suppression.then(NoiseSuppressor::new);
    let mut mono = Vec::new();
    let mut resampled = Vec::new();
    let mut denoised = Vec::new();

    let input = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            mono.clear();
            downmix_into(data, channels, &mut mono);
            resampled.clear();
            if let Err(e) = resampler.process(&mono, &mut resampled) {
                tracing::warn!(error = %e, "Capture resampling failed");
                return;
            }
            match suppressor.as_mut() {
                Some(suppressor) => {
                    denoised.clear();
                    suppressor.process(&resampled, &mut denoised);
                    stream.push(&denoised);
                }
                None => stream.push(&resampled),
            }
        },
        |err: cpal::StreamError| {
            tracing::error!(error = %err, "Capture stream error");
        },
        None,
    )?;
    Ok(input)
}

/// Speaker output fed by the panel's [`Mixer`].
pub struct Playback {
    stop_tx: Option<std_mpsc::Sender<()>>,
}

impl Playback {
    /// Open the default output device. Blocks until the stream is running.
    pub fn start(mixer: Mixer, on_error: ErrorCallback) -> Result<Self, DeviceError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), DeviceError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("mic-playback".into())
            .spawn(move || {
                let output = match start_output(mixer, on_error) {
                    Ok(output) => output,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(output);
            })
            .map_err(|e| DeviceError::Thread(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| DeviceError::Thread("playback thread exited during setup".into()))??;
        tracing::info!("Playback started");
        Ok(Self {
            stop_tx: Some(stop_tx),
        })
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn start_output(mixer: Mixer, on_error: ErrorCallback) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(DeviceError::NoDevice)?;
    let supported = device.default_output_config()?;
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    let output = match format {
        cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, mixer, on_error)?,
        cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, mixer, on_error)?,
        cpal::SampleFormat::U16 => build_output::<u16>(&device, &config, mixer, on_error)?,
        other => return Err(DeviceError::UnsupportedFormat(other)),
    };
    output.play()?;
    Ok(output)
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mixer: Mixer,
    on_error: ErrorCallback,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut resampler = PlaybackResampler::new(SAMPLE_RATE, config.sample_rate.0)?;
    let mut mono = Vec::new();

    let output = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            mono.resize(data.len() / channels, 0.0);
            if let Err(e) = resampler.fill(&mut mono, |block| mixer.render(block)) {
                tracing::warn!(error = %e, "Playback resampling failed");
                mono.fill(0.0);
            }
            for (frame, sample) in data.chunks_mut(channels).zip(&mono) {
                frame.fill(T::from_sample(*sample));
            }
        },
        move |err: cpal::StreamError| {
            tracing::error!(error = %err, "Playback stream error");
            on_error(err.to_string());
        },
        None,
    )?;
    Ok(output)
}

/// Convert interleaved device samples to mono `f32` by averaging each frame.
fn downmix_into<T>(data: &[T], channels: u16, out: &mut Vec<f32>)
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let n = channels.max(1) as usize;
    out.extend(
        data.chunks_exact(n)
            .map(|frame| frame.iter().map(|s| f32::from_sample(*s)).sum::<f32>() / n as f32),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_suppressor_emits_whole_frames() {
        let mut ns = NoiseSuppressor::new();
        let mut out = Vec::new();
        let input: Vec<f32> = (0..1_000).map(|i| (i as f32 * 0.05).sin() * 0.3).collect();

        ns.process(&input, &mut out);
        assert_eq!(out.len(), 2 * FRAME_SIZE);
        assert!(out.iter().all(|s| s.is_finite()));

        ns.process(&input[..440], &mut out);
        assert_eq!(out.len(), 3 * FRAME_SIZE);
    }

    #[test]
    fn test_downmix_averages_frames_and_converts_format() {
        let mut out = Vec::new();
        downmix_into(&[0.5_f32, -0.5, 0.2, 0.4], 2, &mut out);
        assert_eq!(out.len(), 2);
        assert!(out[0].abs() < 1e-6);
        assert!((out[1] - 0.3).abs() < 1e-6);

        out.clear();
        downmix_into(&[i16::MAX, i16::MAX, 0, 0], 2, &mut out);
        assert!((out[0] - 1.0).abs() < 1e-3);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn test_capture_stream_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CpalCaptureStream>();
        assert_send_sync::<Playback>();
    }
}
