use serde::Serialize;
use std::ops::Range;

use super::dsp::mix;
use super::spectrum::Spectrum;

pub const BAND_COUNT: usize = 7;

/// Sub-bass, bass, low-mid, mid, upper-mid, presence, brilliance.
pub const DEFAULT_BOUNDARIES_HZ: [f32; BAND_COUNT + 1] =
    [16.0, 60.0, 250.0, 500.0, 2000.0, 4000.0, 6000.0, 22000.0];

/// `round(freq * N / sample_rate)`, clamped to `[1, N/2 + 1]`.
pub fn frequency_to_bin(freq_hz: f32, sample_rate: u32, transform_size: usize) -> usize {
    let bin = (freq_hz * transform_size as f32 / sample_rate as f32).round();
    let max_bin = transform_size / 2 + 1;
    (bin.max(0.0) as usize).clamp(1, max_bin)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct BandMetrics {
    /// Sum of bin magnitudes in the band this cycle.
    pub energy: f32,
    pub smoothed_energy: f32,
    /// `energy` of the previous cycle.
    pub last_energy: f32,
    /// `|energy - last_energy|`
    pub delta: f32,
    pub accumulated_movement: f32,
    pub accumulated_energy: f32,
}

/// Seven contiguous bands over the magnitude spectrum.
pub struct BandAnalyzer {
    ranges: [Range<usize>; BAND_COUNT],
    metrics: [BandMetrics; BAND_COUNT],
    smoothing: f32,
}

impl BandAnalyzer {
    pub fn new(
        boundaries_hz: &[f32; BAND_COUNT + 1],
        sample_rate: u32,
        transform_size: usize,
        smoothing: f32,
    ) -> Self {
        let bins: [usize; BAND_COUNT + 1] = std::array::from_fn(|i| {
            frequency_to_bin(boundaries_hz[i], sample_rate, transform_size)
        });
        let ranges = std::array::from_fn(|band| bins[band]..bins[band + 1].max(bins[band]));

        Self {
            ranges,
            metrics: [BandMetrics::default(); BAND_COUNT],
            smoothing,
        }
    }

    pub fn update<S: Spectrum + ?Sized>(&mut self, spectrum: &S) {
        for (range, metrics) in self.ranges.iter().zip(self.metrics.iter_mut()) {
            let energy: f32 = range.clone().map(|bin| spectrum.magnitude_at(bin)).sum();
            let delta = (energy - metrics.energy).abs();

            metrics.last_energy = metrics.energy;
            metrics.energy = energy;
            metrics.delta = delta;
            metrics.smoothed_energy = mix(metrics.smoothed_energy, energy, self.smoothing);
            metrics.accumulated_movement += delta;
            metrics.accumulated_energy += energy;
        }
    }

    pub fn metrics(&self) -> &[BandMetrics; BAND_COUNT] {
        &self.metrics
    }

    pub fn ranges(&self) -> &[Range<usize>; BAND_COUNT] {
        &self.ranges
    }

    /// Index of the band whose bin range contains `bin`.
    #[cfg(test)]
    pub fn band_of_bin(&self, bin: usize) -> Option<usize> {
        self.ranges.iter().position(|range| range.contains(&bin))
    }
}
