use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Intervals averaged by [`FpsMeter`].
pub const FPS_WINDOW: usize = 10;

/// Moving-average frame rate over the last [`FPS_WINDOW`] inter-frame
/// intervals. Purely observational.
#[derive(Debug, Default)]
pub struct FpsMeter {
    last: Option<Instant>,
    intervals: VecDeque<Duration>,
}

impl FpsMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self, at: Instant) {
        if let Some(prev) = self.last {
            if self.intervals.len() == FPS_WINDOW {
                self.intervals.pop_front();
            }
            self.intervals.push_back(at.saturating_duration_since(prev));
        }
        self.last = Some(at);
    }

    /// `None` until two frames have been seen.
    pub fn fps(&self) -> Option<f32> {
        if self.intervals.is_empty() {
            return None;
        }
        let total: Duration = self.intervals.iter().sum();
        if total.is_zero() {
            return None;
        }
        Some(self.intervals.len() as f32 / total.as_secs_f32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn averages_recent_intervals_only() {
        let mut m = FpsMeter::new();
        let t0 = Instant::now();
        assert!(m.fps().is_none());

        // 5 slow frames then 11 at 50 ms: only the fast ones remain.
        let mut t = t0;
        for _ in 0..5 {
            m.tick(t);
            t += Duration::from_millis(500);
        }
        for _ in 0..11 {
            m.tick(t);
            t += Duration::from_millis(50);
        }
        assert_relative_eq!(m.fps().unwrap(), 20.0, epsilon = 0.01);
    }
}
