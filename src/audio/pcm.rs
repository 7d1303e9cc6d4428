//! Fixed-capacity stereo sample history shared between the ingest thread and
//! the analysis loop.

use serde::Deserialize;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{AnalysisError, Result};

/// How the two channels are folded into the single channel fed to the FFT.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MonoMode {
    /// Left channel only.
    Left,
    /// Mean of left and right.
    #[default]
    Average,
}

/// Dual-channel ring holding the most recent `capacity` frames.
///
/// `write_cursor` always equals `total_written % capacity`.
pub struct PcmRing {
    left: Vec<f32>,
    right: Vec<f32>,
    write_cursor: usize,
    total_written: u64,
}

impl PcmRing {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(AnalysisError::ZeroCapacity);
        }
        Ok(Self {
            left: vec![0.0; capacity],
            right: vec![0.0; capacity],
            write_cursor: 0,
            total_written: 0,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.left.len()
    }

    #[inline]
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    #[cfg(test)]
    pub fn write_cursor(&self) -> usize {
        self.write_cursor
    }

    /// Number of frames that came from the stream rather than the initial
    /// silence.
    #[cfg(test)]
    pub fn resident(&self) -> usize {
        self.total_written.min(self.capacity() as u64) as usize
    }

    /// Append frames, overwriting the oldest history. Only the trailing
    /// `capacity` frames of an oversized write survive.
    pub fn write(&mut self, left: &[f32], right: &[f32]) {
        debug_assert_eq!(left.len(), right.len(), "channel slices must match");
        let count = left.len().min(right.len());
        if count == 0 {
            return;
        }

        let capacity = self.capacity();
        let skipped = count.saturating_sub(capacity);
        let left = &left[skipped..count];
        let right = &right[skipped..count];
        let n = left.len();

        let start = (self.write_cursor + skipped) % capacity;
        let first = (capacity - start).min(n);
        self.left[start..start + first].copy_from_slice(&left[..first]);
        self.right[start..start + first].copy_from_slice(&right[..first]);
        self.left[..n - first].copy_from_slice(&left[first..]);
        self.right[..n - first].copy_from_slice(&right[first..]);

        self.total_written += count as u64;
        self.write_cursor = (self.total_written % capacity as u64) as usize;
    }

    /// Split the most recent `length` frames into at most two physical ranges,
    /// oldest first.
    fn ordered_ranges(&self, length: usize) -> (Range<usize>, Range<usize>) {
        let capacity = self.capacity();
        let start = (self.write_cursor + capacity - length) % capacity;
        let tail = capacity - start;
        if length <= tail {
            (start..start + length, 0..0)
        } else {
            (start..capacity, 0..length - tail)
        }
    }

    /// Fill `out` with the most recent `out.len()` samples in chronological
    /// order, ending at the latest write.
    pub fn snapshot_mono_into(&self, out: &mut [f32], mode: MonoMode) -> Result<()> {
        let length = out.len();
        if length > self.capacity() {
            return Err(AnalysisError::SnapshotTooLong {
                requested: length,
                capacity: self.capacity(),
            });
        }

        let (a, b) = self.ordered_ranges(length);
        let (head, rest) = out.split_at_mut(a.len());
        match mode {
            MonoMode::Left => {
                head.copy_from_slice(&self.left[a]);
                rest.copy_from_slice(&self.left[b]);
            }
            MonoMode::Average => {
                downmix(head, &self.left[a.clone()], &self.right[a]);
                downmix(rest, &self.left[b.clone()], &self.right[b]);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn snapshot_mono(&self, length: usize, mode: MonoMode) -> Result<Vec<f32>> {
        let mut out = vec![0.0; length];
        self.snapshot_mono_into(&mut out, mode)?;
        Ok(out)
    }

    /// The whole history of both channels, oldest first.
    pub fn snapshot_stereo(&self) -> (Vec<f32>, Vec<f32>) {
        let (a, b) = self.ordered_ranges(self.capacity());
        let mut left = Vec::with_capacity(self.capacity());
        let mut right = Vec::with_capacity(self.capacity());
        left.extend_from_slice(&self.left[a.clone()]);
        left.extend_from_slice(&self.left[b.clone()]);
        right.extend_from_slice(&self.right[a]);
        right.extend_from_slice(&self.right[b]);
        (left, right)
    }
}

fn downmix(out: &mut [f32], left: &[f32], right: &[f32]) {
    for ((o, l), r) in out.iter_mut().zip(left).zip(right) {
        *o = (l + r) * 0.5;
    }
}

/// Mutex-guarded handle to a [`PcmRing`].
///
/// The lock is held only while frames are copied in or a snapshot is copied
/// out, so a snapshot always reflects whole completed writes.
#[derive(Clone)]
pub struct SharedPcm {
    inner: Arc<Mutex<PcmRing>>,
    capacity: usize,
}

impl SharedPcm {
    pub fn new(capacity: usize) -> Result<Self> {
        let ring = PcmRing::new(capacity)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(ring)),
            capacity,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // Samples are plain floats; a panic on the other side cannot leave them
    // in a state worse than stale audio.
    fn lock(&self) -> MutexGuard<'_, PcmRing> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self, left: &[f32], right: &[f32]) {
        self.lock().write(left, right);
    }

    pub fn snapshot_mono_into(&self, out: &mut [f32], mode: MonoMode) -> Result<()> {
        self.lock().snapshot_mono_into(out, mode)
    }

    pub fn snapshot_stereo(&self) -> (Vec<f32>, Vec<f32>) {
        self.lock().snapshot_stereo()
    }

    pub fn total_written(&self) -> u64 {
        self.lock().total_written()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: usize, len: usize) -> Vec<f32> {
        (start..start + len).map(|i| i as f32).collect()
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(PcmRing::new(0), Err(AnalysisError::ZeroCapacity)));
    }

    #[test]
    fn snapshot_is_chronological_after_many_wraps() {
        let mut ring = PcmRing::new(10).unwrap();
        let mut next = 0;
        // Uneven chunk sizes so the cursor lands everywhere
        for chunk in [3, 7, 4, 9, 1, 6, 8, 2, 5] {
            let data = ramp(next, chunk);
            ring.write(&data, &data);
            next += chunk;
        }
        assert_eq!(ring.total_written(), next as u64);
        assert_eq!(ring.write_cursor(), next % 10);

        for count in 0..=10 {
            let snap = ring.snapshot_mono(count, MonoMode::Left).unwrap();
            assert_eq!(snap, ramp(next - count, count), "count {}", count);
        }
    }

    #[test]
    fn full_capacity_round_trip() {
        let mut ring = PcmRing::new(16).unwrap();
        ring.write(&ramp(100, 5), &ramp(100, 5));
        let data = ramp(0, 16);
        ring.write(&data, &data);
        assert_eq!(ring.snapshot_mono(16, MonoMode::Left).unwrap(), data);
    }

    #[test]
    fn oversized_write_keeps_newest() {
        let mut ring = PcmRing::new(8).unwrap();
        ring.write(&ramp(0, 3), &ramp(0, 3));
        let data = ramp(10, 20);
        ring.write(&data, &data);
        assert_eq!(ring.total_written(), 23);
        assert_eq!(ring.write_cursor(), 23 % 8);
        assert_eq!(ring.resident(), 8);
        assert_eq!(ring.snapshot_mono(8, MonoMode::Left).unwrap(), ramp(22, 8));
    }

    #[test]
    fn snapshot_longer_than_capacity_fails() {
        let ring = PcmRing::new(4).unwrap();
        assert!(matches!(
            ring.snapshot_mono(5, MonoMode::Left),
            Err(AnalysisError::SnapshotTooLong { requested: 5, capacity: 4 })
        ));
    }

    #[test]
    fn mono_modes() {
        let mut ring = PcmRing::new(4).unwrap();
        ring.write(&[1.0, 2.0, 3.0], &[3.0, 0.0, -3.0]);
        assert_eq!(ring.snapshot_mono(3, MonoMode::Left).unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(ring.snapshot_mono(3, MonoMode::Average).unwrap(), vec![2.0, 1.0, 0.0]);
    }

    #[test]
    fn unwritten_history_reads_as_silence() {
        let mut ring = PcmRing::new(6).unwrap();
        ring.write(&[5.0, 6.0], &[5.0, 6.0]);
        assert_eq!(ring.resident(), 2);
        assert_eq!(
            ring.snapshot_mono(4, MonoMode::Average).unwrap(),
            vec![0.0, 0.0, 5.0, 6.0]
        );
    }

    #[test]
    fn stereo_snapshot_keeps_channels_apart() {
        let mut ring = PcmRing::new(4).unwrap();
        ring.write(&ramp(0, 6), &ramp(100, 6));
        let (left, right) = ring.snapshot_stereo();
        assert_eq!(left, ramp(2, 4));
        assert_eq!(right, ramp(102, 4));
    }

    #[test]
    fn shared_handle_sees_writes_from_other_thread() {
        let shared = SharedPcm::new(1024).unwrap();
        let writer = shared.clone();
        let handle = std::thread::spawn(move || {
            for block in 0..64 {
                let data = ramp(block * 16, 16);
                writer.write(&data, &data);
            }
        });
        handle.join().unwrap();

        assert_eq!(shared.total_written(), 1024);
        let mut out = vec![0.0; 32];
        shared.snapshot_mono_into(&mut out, MonoMode::Left).unwrap();
        assert_eq!(out, ramp(1024 - 32, 32));
    }

    #[test]
    fn snapshots_during_concurrent_writes_are_contiguous() {
        let shared = SharedPcm::new(4096).unwrap();
        let writer = shared.clone();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let finished = done.clone();
        // Sample values count up from 1.0, so 0.0 only ever means "not written yet"
        let handle = std::thread::spawn(move || {
            let mut next = 1;
            while next < 200_000 {
                let data = ramp(next, 97);
                writer.write(&data, &data);
                next += 97;
            }
            finished.store(true, std::sync::atomic::Ordering::Release);
        });

        let mut out = vec![0.0; 1000];
        let mut snapshots = 0;
        while !done.load(std::sync::atomic::Ordering::Acquire) || snapshots == 0 {
            shared.snapshot_mono_into(&mut out, MonoMode::Left).unwrap();
            let first = out.iter().position(|&v| v != 0.0).unwrap_or(out.len());
            assert!(out[first..].iter().all(|&v| v != 0.0), "silence after data");
            for pair in out[first..].windows(2) {
                assert_eq!(pair[1], pair[0] + 1.0, "torn snapshot");
            }
            if first < out.len() {
                // A snapshot always ends on a block boundary
                assert_eq!(out[out.len() - 1] as usize % 97, 0);
            }
            snapshots += 1;
        }
        handle.join().unwrap();
    }
}
