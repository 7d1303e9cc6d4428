use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

use super::dsp::hamming_window;
use super::pcm::{MonoMode, SharedPcm};
use crate::error::{AnalysisError, Result};

/// Read access to a magnitude spectrum.
pub trait Spectrum {
    /// Transform size `N`; valid bins are `0..=N/2`.
    fn size(&self) -> usize;
    fn magnitude_at(&self, index: usize) -> f32;

    /// Magnitude of bin `index`, zero past `N/2`.
    fn bin_at(&self, index: usize) -> f32 {
        if index > self.size() / 2 {
            return 0.0;
        }
        self.magnitude_at(index)
    }
}

/// Windowed real FFT over the most recent PCM history.
///
/// `spectrum` uses the half-complex packing: `spectrum[k]` is the real part of
/// bin `k` for `0..=N/2`, `spectrum[N - k]` the imaginary part of bin `k` for
/// `0 < k < N/2`. DC and Nyquist carry no imaginary part.
pub struct SpectralTransform {
    size: usize,
    mono: MonoMode,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    input: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    spectrum: Vec<f32>,
    peak_hold: Vec<f32>,
    peak_decay: f32,
    dominant_bin: usize,
}

impl SpectralTransform {
    pub fn new(size: usize, mono: MonoMode, peak_decay: f32) -> Result<Self> {
        if size == 0 || size % 2 != 0 {
            return Err(AnalysisError::OddTransformSize(size));
        }

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(size);
        let scratch_len = fft.get_inplace_scratch_len();

        Ok(Self {
            size,
            mono,
            fft,
            window: hamming_window(size),
            input: vec![0.0; size],
            buffer: vec![Complex::new(0.0, 0.0); size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            spectrum: vec![0.0; size],
            peak_hold: vec![0.0; size],
            peak_decay,
            dominant_bin: 0,
        })
    }

    /// Snapshot `capture_length` mono samples from `store`, window them and
    /// run the transform. Shorter captures are zero-padded to the transform
    /// size.
    pub fn analyze(&mut self, store: &SharedPcm, capture_length: usize) -> Result<()> {
        self.check_capture(capture_length)?;
        store.snapshot_mono_into(&mut self.input[..capture_length], self.mono)?;
        self.input[capture_length..].fill(0.0);
        self.transform(capture_length);
        Ok(())
    }

    /// Same as [`analyze`](Self::analyze) on samples already in hand.
    #[cfg(test)]
    pub fn analyze_samples(&mut self, samples: &[f32]) -> Result<()> {
        let capture_length = samples.len();
        self.check_capture(capture_length)?;
        self.input[..capture_length].copy_from_slice(samples);
        self.input[capture_length..].fill(0.0);
        self.transform(capture_length);
        Ok(())
    }

    fn check_capture(&self, capture_length: usize) -> Result<()> {
        if capture_length < 2 || capture_length > self.size {
            return Err(AnalysisError::CaptureTooLong {
                requested: capture_length,
                size: self.size,
            });
        }
        Ok(())
    }

    fn transform(&mut self, capture_length: usize) {
        if self.window.len() != capture_length {
            self.window = hamming_window(capture_length);
        }

        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = if i < capture_length {
                self.input[i] * self.window[i]
            } else {
                0.0
            };
            *slot = Complex::new(sample, 0.0);
        }
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let n = self.size;
        let half = n / 2;
        self.spectrum[0] = self.buffer[0].re;
        self.spectrum[half] = self.buffer[half].re;
        for k in 1..half {
            self.spectrum[k] = self.buffer[k].re;
            self.spectrum[n - k] = self.buffer[k].im;
        }

        for (peak, &value) in self.peak_hold.iter_mut().zip(&self.spectrum) {
            *peak = (self.peak_decay * *peak).max(value);
        }

        let mut max_power = 0.0f32;
        let mut max_index = 0;
        for k in 0..=half {
            let power = self.power_at(k);
            if power > max_power {
                max_power = power;
                max_index = k;
            }
        }
        self.dominant_bin = max_index;
    }

    fn power_at(&self, index: usize) -> f32 {
        let half = self.size / 2;
        if index > half {
            return 0.0;
        }
        let re = self.spectrum[index];
        let im = if index > 0 && index < half {
            self.spectrum[self.size - index]
        } else {
            0.0
        };
        re * re + im * im
    }

    /// Packed real/imaginary output of the last cycle.
    pub fn spectrum(&self) -> &[f32] {
        &self.spectrum
    }

    pub fn peak_hold(&self) -> &[f32] {
        &self.peak_hold
    }

    pub fn dominant_bin(&self) -> usize {
        self.dominant_bin
    }

    /// Period in samples of the strongest bin.
    pub fn dominant_period(&self) -> usize {
        self.size / (self.dominant_bin() + 1)
    }
}

impl Spectrum for SpectralTransform {
    fn size(&self) -> usize {
        self.size
    }

    fn magnitude_at(&self, index: usize) -> f32 {
        self.power_at(index).sqrt()
    }
}
