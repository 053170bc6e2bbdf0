//! PCM media streams shared between capture, transport, and the audio graph.
//!
//! A [`MediaStream`] is a cloneable handle onto a bounded queue of 48 kHz mono `f32`
//! samples. Producers (a capture callback, a track decoder) push; a single consumer
//! drains. When the queue is full the oldest samples are discarded so latency stays
//! bounded instead of growing.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Sample rate used for everything behind the codec boundary.
pub const SAMPLE_RATE: u32 = 48_000;

/// One Opus frame (20 ms) at [`SAMPLE_RATE`].
pub const FRAME_SAMPLES: usize = 960;

/// Default queue bound: half a second of audio.
const DEFAULT_CAPACITY: usize = SAMPLE_RATE as usize / 2;

#[derive(Clone)]
pub struct MediaStream {
    id: Arc<str>,
    inner: Arc<Mutex<StreamBuffer>>,
}

struct StreamBuffer {
    samples: VecDeque<f32>,
    capacity: usize,
    ended: bool,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_capacity(id, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(id: impl Into<String>, capacity: usize) -> Self {
        let id: String = id.into();
        Self {
            id: Arc::from(id),
            inner: Arc::new(Mutex::new(StreamBuffer {
                samples: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                ended: false,
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append samples, discarding the oldest ones beyond capacity.
    pub fn push(&self, samples: &[f32]) {
        let mut buf = self.inner.lock();
        if buf.ended {
            return;
        }
        buf.samples.extend(samples.iter().copied());
        let overflow = buf.samples.len().saturating_sub(buf.capacity);
        if overflow > 0 {
            buf.samples.drain(..overflow);
        }
    }

    /// Pop up to `out.len()` samples into `out`. Returns how many were written;
    /// the remainder of `out` is left untouched.
    pub fn read(&self, out: &mut [f32]) -> usize {
        let mut buf = self.inner.lock();
        let n = out.len().min(buf.samples.len());
        for (slot, sample) in out.iter_mut().zip(buf.samples.drain(..n)) {
            *slot = sample;
        }
        n
    }

    /// Discard everything queued without ending the stream.
    pub fn clear(&self) {
        self.inner.lock().samples.clear();
    }

    pub fn buffered(&self) -> usize {
        self.inner.lock().samples.len()
    }

    /// Mark the stream finished; later pushes are ignored.
    pub fn end(&self) {
        let mut buf = self.inner.lock();
        buf.ended = true;
        buf.samples.clear();
    }

    pub fn is_ended(&self) -> bool {
        self.inner.lock().ended
    }

    /// Whether two handles refer to the same underlying stream.
    pub fn same_stream(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("buffered", &self.buffered())
            .finish()
    }
}
