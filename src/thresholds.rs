//! Per-fan hysteresis over the temperature threshold table.

use crate::model_config::TemperatureThreshold;

/// Maps a temperature to a fan speed percentage while holding the
/// current table row as long as the temperature stays inside the row's
/// `[DownThreshold, UpThreshold)` band. This is what keeps the fan from
/// flapping at a boundary.
#[derive(Debug, Clone)]
pub struct ThresholdManager {
    /// Sorted by `UpThreshold`; validation guarantees non-empty.
    thresholds: Vec<TemperatureThreshold>,
    current: Option<usize>,
}

impl ThresholdManager {
    pub fn new(mut thresholds: Vec<TemperatureThreshold>) -> Self {
        thresholds.sort_by(|a, b| a.up_threshold.total_cmp(&b.up_threshold));
        Self {
            thresholds,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&TemperatureThreshold> {
        self.current.map(|i| &self.thresholds[i])
    }

    /// Feed one temperature; returns the selected row's fan speed.
    pub fn update(&mut self, temperature: f32) -> f32 {
        let last = self.thresholds.len() - 1;
        let i = match self.current {
            None => self.highest_up_at_most(temperature),
            Some(i) => {
                let row = self.thresholds[i];
                if temperature >= row.up_threshold && i < last {
                    // Leaving the band upwards: land on the highest row
                    // whose UpThreshold has been crossed, at minimum the
                    // next row.
                    self.highest_up_at_most(temperature).max(i + 1).min(last)
                } else if temperature < row.down_threshold {
                    self.highest_down_at_most(temperature)
                } else {
                    i
                }
            }
        };
        self.current = Some(i);
        self.thresholds[i].fan_speed
    }

    fn highest_up_at_most(&self, t: f32) -> usize {
        self.thresholds
            .iter()
            .rposition(|row| row.up_threshold <= t)
            .unwrap_or(0)
    }

    fn highest_down_at_most(&self, t: f32) -> usize {
        self.thresholds
            .iter()
            .rposition(|row| row.down_threshold <= t)
            .unwrap_or(0)
    }
}
