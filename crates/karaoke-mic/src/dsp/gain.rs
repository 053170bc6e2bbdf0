//! Exponentially smoothed gain.

use std::time::Duration;

/// Below this distance the gain snaps to its target.
const SNAP_EPSILON: f32 = 1e-6;

/// A gain that approaches its target exponentially, one sample at a time.
///
/// Each sample moves `current` towards `target` by a fixed fraction, so after one time
/// constant the remaining distance is about 37% of where it started. Changing the
/// target never produces a step in the output.
#[derive(Debug, Clone)]
pub struct SmoothedGain {
    current: f32,
    target: f32,
    coeff: f32,
}

impl SmoothedGain {
    pub fn new(initial: f32, time_constant: Duration, sample_rate: u32) -> Self {
        let samples = time_constant.as_secs_f32() * sample_rate as f32;
        let coeff = if samples <= 0.0 {
            1.0
        } else {
            1.0 - (-1.0 / samples).exp()
        };
        Self {
            current: initial,
            target: initial,
            coeff,
        }
    }

    pub fn set_target(&mut self, target: f32) {
        self.target = target;
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn is_settled(&self) -> bool {
        self.current == self.target
    }

    /// Advance one sample and return the gain to apply to it.
    pub fn next_gain(&mut self) -> f32 {
        let delta = self.target - self.current;
        if delta.abs() < SNAP_EPSILON {
            self.current = self.target;
        } else {
            self.current += delta * self.coeff;
        }
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_time_constant_covers_most_of_the_distance() {
        let mut gain = SmoothedGain::new(0.0, Duration::from_millis(100), 48_000);
        gain.set_target(1.0);
        for _ in 0..4_800 {
            gain.next_gain();
        }
        let reached = gain.current();
        assert!((reached - (1.0 - (-1.0f32).exp())).abs() < 0.01, "{reached}");
    }

    #[test]
    fn test_no_audible_step_on_change() {
        let mut gain = SmoothedGain::new(1.0, Duration::from_millis(100), 48_000);
        gain.set_target(0.0);
        let mut previous = gain.current();
        for _ in 0..48_000 {
            let g = gain.next_gain();
            assert!((previous - g).abs() < 0.001);
            previous = g;
        }
        assert!(gain.current() < 1e-4);
    }

    #[test]
    fn test_settles_exactly() {
        let mut gain = SmoothedGain::new(0.5, Duration::from_millis(1), 48_000);
        gain.set_target(0.25);
        for _ in 0..10_000 {
            gain.next_gain();
        }
        assert!(gain.is_settled());
        assert_eq!(gain.current(), 0.25);
    }
}
