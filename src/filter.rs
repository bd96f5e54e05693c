//! Time-windowed temperature smoothing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// FIFO of samples collected over the preceding window. The filtered
/// value is the arithmetic mean of resident samples; eviction uses
/// monotonic time, and the freshly pushed sample is never evicted.
#[derive(Debug)]
pub struct TemperatureFilter {
    window: Duration,
    samples: VecDeque<(Instant, f32)>,
}

impl TemperatureFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Push a sample taken at `at` and return the new filtered value.
    pub fn push(&mut self, at: Instant, value: f32) -> f32 {
        while let Some(&(t, _)) = self.samples.front() {
            if at.duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.push_back((at, value));
        self.filtered()
    }

    pub fn filtered(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.samples.iter().map(|&(_, v)| v).sum();
        sum / self.samples.len() as f32
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtered_is_mean_of_resident_samples() {
        let mut filter = TemperatureFilter::new(Duration::from_millis(1000));
        let start = Instant::now();
        assert_eq!(filter.push(start, 40.0), 40.0);
        assert_eq!(filter.push(start + Duration::from_millis(500), 60.0), 50.0);
    }

    #[test]
    fn samples_older_than_the_window_are_evicted() {
        let mut filter = TemperatureFilter::new(Duration::from_millis(1000));
        let start = Instant::now();
        filter.push(start, 40.0);
        filter.push(start + Duration::from_millis(500), 50.0);
        // 40.0 is now older than the window and must be gone.
        let value = filter.push(start + Duration::from_millis(1400), 60.0);
        assert_eq!(value, 55.0);
    }

    #[test]
    fn latest_sample_always_survives() {
        let mut filter = TemperatureFilter::new(Duration::from_millis(10));
        let start = Instant::now();
        filter.push(start, 40.0);
        let value = filter.push(start + Duration::from_secs(60), 80.0);
        assert_eq!(value, 80.0);
    }

    #[test]
    fn reset_clears_history() {
        let mut filter = TemperatureFilter::new(Duration::from_millis(1000));
        let start = Instant::now();
        filter.push(start, 40.0);
        filter.reset();
        assert_eq!(filter.push(start + Duration::from_millis(1), 70.0), 70.0);
    }
}
