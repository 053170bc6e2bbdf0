//! Silence detection driving the automatic close of idle mics.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceVerdict {
    Sounding,
    Silent { elapsed: Duration },
    /// Returned exactly once, on the observation that crosses the timeout.
    TimedOut,
}

/// Tracks how long a stream has stayed below the level threshold.
#[derive(Debug, Clone)]
pub struct SilenceTracker {
    threshold: f32,
    timeout: Duration,
    started_at: Option<Instant>,
    elapsed: Duration,
    fired: bool,
}

impl SilenceTracker {
    pub fn new(threshold: f32, timeout: Duration) -> Self {
        Self {
            threshold,
            timeout,
            started_at: None,
            elapsed: Duration::ZERO,
            fired: false,
        }
    }

    pub fn observe(&mut self, level: f32, now: Instant) -> SilenceVerdict {
        if level >= self.threshold {
            self.started_at = None;
            self.elapsed = Duration::ZERO;
            return SilenceVerdict::Sounding;
        }

        let started = *self.started_at.get_or_insert(now);
        self.elapsed = now.saturating_duration_since(started);

        if self.elapsed > self.timeout && !self.fired {
            self.fired = true;
            SilenceVerdict::TimedOut
        } else {
            SilenceVerdict::Silent {
                elapsed: self.elapsed,
            }
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Time left before the automatic close, once silence has lasted past `warn_after`.
    pub fn countdown(&self, warn_after: Duration) -> Option<Duration> {
        (self.elapsed > warn_after).then(|| self.timeout.saturating_sub(self.elapsed))
    }
}
