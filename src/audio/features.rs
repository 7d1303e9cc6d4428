use bytemuck::{Pod, Zeroable};
use serde::Serialize;

use super::bands::{BandMetrics, BAND_COUNT};
use super::beat::BeatState;

/// Per-band slice of [`AnalysisResult`], padded to a 32-byte stride.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, Serialize)]
pub struct BandRecord {
    pub accumulated_energy: f32,
    pub energy: f32,
    pub smoothed_energy: f32,
    pub delta: f32,
    pub movement: f32,
    #[serde(skip)]
    pub _reserved: [f32; 3],
}

/// Snapshot handed to the renderer each cycle.
///
/// The consumer reads this as a raw blob, so field order and size must not
/// change: 16 header bytes followed by seven 32-byte band records.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, Serialize)]
pub struct AnalysisResult {
    pub is_beat: i32,
    pub beat_count: i32,
    /// Period in samples of the strongest bin.
    pub dominant_period: i32,
    /// Current beat history length in cycles.
    pub window_len: i32,
    pub bands: [BandRecord; BAND_COUNT],
}

impl AnalysisResult {
    pub const SIZE: usize = std::mem::size_of::<AnalysisResult>();

    pub fn new(beat: &BeatState, bands: &[BandMetrics; BAND_COUNT], dominant_period: usize) -> Self {
        Self {
            is_beat: beat.is_beat as i32,
            beat_count: beat.beat_count as i32,
            dominant_period: dominant_period.min(i32::MAX as usize) as i32,
            window_len: beat.window_len.min(i32::MAX as usize) as i32,
            bands: std::array::from_fn(|i| {
                let m = &bands[i];
                BandRecord {
                    accumulated_energy: m.accumulated_energy,
                    energy: m.energy,
                    smoothed_energy: m.smoothed_energy,
                    delta: m.delta,
                    movement: m.accumulated_movement,
                    _reserved: [0.0; 3],
                }
            }),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_fixed() {
        assert_eq!(std::mem::size_of::<BandRecord>(), 32);
        assert_eq!(AnalysisResult::SIZE, 16 + 7 * 32);
    }

    #[test]
    fn fields_land_at_stable_offsets() {
        let beat = BeatState {
            is_beat: true,
            beat_count: 7,
            window_len: 500,
        };
        let mut bands = [BandMetrics::default(); BAND_COUNT];
        bands[1].energy = 2.5;
        bands[1].accumulated_movement = 9.0;

        let result = AnalysisResult::new(&beat, &bands, 93);
        let bytes = result.as_bytes();
        let int_at = |offset: usize| i32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap());
        let float_at = |offset: usize| f32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap());

        assert_eq!(int_at(0), 1);
        assert_eq!(int_at(4), 7);
        assert_eq!(int_at(8), 93);
        assert_eq!(int_at(12), 500);
        // Band 1 starts at 16 + 32
        assert_eq!(float_at(48 + 4), 2.5);
        assert_eq!(float_at(48 + 16), 9.0);
    }
}
