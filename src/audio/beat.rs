//! Adaptive per-frequency beat detection.
//!
//! Each tracked frequency keeps a ring of its recent bin magnitudes covering
//! roughly `target_history_ms` of wall-clock time. Because the analysis loop
//! does not run at a guaranteed rate, the ring length follows an EMA of the
//! measured cycle interval and is rebuilt whenever it drifts too far.

use serde::Serialize;
use std::fmt::Write as _;
use std::time::Instant;

use super::bands::frequency_to_bin;
use super::dsp::mix;
use super::spectrum::Spectrum;
use crate::config::BeatConfig;

/// Lower bound of the interval EMA, keeps `target / interval` finite.
const MIN_INTERVAL_MS: f32 = 1e-3;

/// Multiple of the short average shown in the trace `thresh` column.
const TRACE_RATIO_THRESHOLD: f32 = 3.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowState {
    Stable,
    Resizing { from: usize, to: usize },
}

/// Merged detector output for one cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BeatState {
    pub is_beat: bool,
    pub beat_count: u32,
    pub window_len: usize,
}

/// Short-term statistics of a single tracked bin.
///
/// `sum` and `sum_of_squares` always equal the sums over `history`; they are
/// kept in `f64` and rebuilt from scratch every time the cursor wraps.
#[derive(Clone, Debug)]
pub struct TrackedBeatFreq {
    frequency_hz: f32,
    target_bin: usize,
    history: Vec<f32>,
    cursor: usize,
    sum: f64,
    sum_of_squares: f64,
    long_term_average: f32,
    short_average: f32,
    standard_deviation: f32,
    current_value: f32,
    is_beat: bool,
}

impl TrackedBeatFreq {
    fn new(frequency_hz: f32, target_bin: usize, window_len: usize, long_term_average: f32) -> Self {
        Self {
            frequency_hz,
            target_bin,
            history: vec![0.0; window_len.max(1)],
            cursor: 0,
            sum: 0.0,
            sum_of_squares: 0.0,
            long_term_average,
            short_average: 0.0,
            standard_deviation: 0.0,
            current_value: 0.0,
            is_beat: false,
        }
    }

    pub fn frequency_hz(&self) -> f32 {
        self.frequency_hz
    }

    pub fn target_bin(&self) -> usize {
        self.target_bin
    }

    #[cfg(test)]
    pub fn window_len(&self) -> usize {
        self.history.len()
    }

    #[cfg(test)]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn short_average(&self) -> f32 {
        self.short_average
    }

    pub fn long_term_average(&self) -> f32 {
        self.long_term_average
    }

    pub fn standard_deviation(&self) -> f32 {
        self.standard_deviation
    }

    #[cfg(test)]
    pub fn current_value(&self) -> f32 {
        self.current_value
    }

    fn recompute_sums(&mut self) {
        let (sum, sum_of_squares) = sums(&self.history);
        self.sum = sum;
        self.sum_of_squares = sum_of_squares;
    }

    /// Rebuild the ring at `new_len`, keeping the newest samples in
    /// chronological order and padding with their mean. The cursor restarts
    /// at the oldest kept sample.
    fn resize(&mut self, new_len: usize) {
        let new_len = new_len.max(1);
        let old_len = self.history.len();
        let keep = old_len.min(new_len);
        let start = (self.cursor + old_len - keep) % old_len;

        let mut history = Vec::with_capacity(new_len);
        history.extend((0..keep).map(|i| self.history[(start + i) % old_len]));
        let (kept_sum, _) = sums(&history);
        let average = (kept_sum / keep as f64) as f32;
        history.resize(new_len, average);

        self.history = history;
        self.cursor = 0;
        self.recompute_sums();
    }

    fn observe(&mut self, value: f32, config: &BeatConfig) -> bool {
        let value = if value.is_finite() { value } else { 0.0 };
        let window = self.history.len();

        let evicted = self.history[self.cursor] as f64;
        self.sum -= evicted;
        self.sum_of_squares -= evicted * evicted;

        self.history[self.cursor] = value;
        self.sum += value as f64;
        self.sum_of_squares += value as f64 * value as f64;

        self.cursor = (self.cursor + 1) % window;
        if self.cursor == 0 {
            self.recompute_sums();
        }

        self.current_value = value;
        self.long_term_average = mix(self.long_term_average, value, config.long_term_smoothing);

        let n = window as f64;
        let short_average = self.sum / n;
        // Cancellation can push this slightly below zero
        let variance = (self.sum_of_squares / n - short_average * short_average).max(0.0);
        self.short_average = short_average as f32;
        self.standard_deviation = variance.sqrt() as f32;

        let above_noise = self.short_average > config.noise_threshold_factor * self.long_term_average;
        let above_spread =
            value > self.short_average + config.sd_multiplier * self.standard_deviation;
        self.is_beat = above_noise && above_spread;
        self.is_beat
    }
}

fn sums(values: &[f32]) -> (f64, f64) {
    values.iter().fold((0.0, 0.0), |(sum, squares), &v| {
        let v = v as f64;
        (sum + v, squares + v * v)
    })
}

pub struct BeatDetector {
    config: BeatConfig,
    tracked: Vec<TrackedBeatFreq>,
    window_len: usize,
    state: WindowState,
    interval_ema_ms: f32,
    last_cycle: Instant,
    beat_count: u32,
    was_beat: bool,
    resizes: u64,
}

impl BeatDetector {
    pub fn new(config: &BeatConfig, sample_rate: u32, transform_size: usize) -> Self {
        let interval_ema_ms = config.initial_interval_ms.max(MIN_INTERVAL_MS);
        let window_len = desired_window_len(config, interval_ema_ms);

        let tracked: Vec<TrackedBeatFreq> = config
            .frequencies_hz
            .iter()
            .map(|&hz| {
                let bin = frequency_to_bin(hz, sample_rate, transform_size);
                TrackedBeatFreq::new(hz, bin, window_len, config.initial_long_term_average)
            })
            .collect();

        for t in &tracked {
            log::debug!("Tracking beats at {} Hz (bin {})", t.frequency_hz, t.target_bin);
        }

        Self {
            config: config.clone(),
            tracked,
            window_len,
            state: WindowState::Stable,
            interval_ema_ms,
            last_cycle: Instant::now(),
            beat_count: 0,
            was_beat: false,
            resizes: 0,
        }
    }

    /// Run one cycle, measuring the interval since the previous one.
    pub fn update<S: Spectrum + ?Sized>(&mut self, spectrum: &S, now: Instant) -> BeatState {
        let interval_ms = now.saturating_duration_since(self.last_cycle).as_secs_f32() * 1000.0;
        self.last_cycle = now;
        self.update_with_interval(spectrum, interval_ms)
    }

    /// Run one cycle with an externally measured interval.
    pub fn update_with_interval<S: Spectrum + ?Sized>(
        &mut self,
        spectrum: &S,
        interval_ms: f32,
    ) -> BeatState {
        self.observe_interval(interval_ms);
        self.settle_window();

        let mut any_beat = false;
        for tracked in &mut self.tracked {
            let value = spectrum.bin_at(tracked.target_bin);
            any_beat |= tracked.observe(value, &self.config);
        }

        if any_beat && !self.was_beat {
            self.beat_count = self.beat_count.wrapping_add(1);
        }
        self.was_beat = any_beat;

        if log::log_enabled!(log::Level::Trace) {
            log::trace!("{}", self.trace_line());
        }

        self.state()
    }

    fn observe_interval(&mut self, interval_ms: f32) {
        let interval_ms = if interval_ms.is_finite() {
            interval_ms.max(0.0)
        } else {
            self.interval_ema_ms
        };
        let previous_ema = self.interval_ema_ms;
        self.interval_ema_ms = mix(previous_ema, interval_ms, self.config.interval_smoothing)
            .max(MIN_INTERVAL_MS);

        let desired = desired_window_len(&self.config, self.interval_ema_ms);
        let drift = (desired as f32 - self.window_len as f32).abs() / self.window_len as f32;
        if drift > self.config.resize_tolerance {
            log::debug!(
                "Beat window drift {:.0}%: interval prev {:.2}ms, current {:.2}ms, smoothed {:.2}ms; samples {} -> {}",
                drift * 100.0,
                previous_ema,
                interval_ms,
                self.interval_ema_ms,
                self.window_len,
                desired
            );
            self.state = WindowState::Resizing {
                from: self.window_len,
                to: desired,
            };
        }
    }

    /// Apply a pending resize to every tracked frequency at once.
    fn settle_window(&mut self) {
        if let WindowState::Resizing { from, to } = self.state {
            for tracked in &mut self.tracked {
                tracked.resize(to);
            }
            log::debug!("Beat window resized {} -> {} cycles", from, to);
            self.window_len = to;
            self.resizes += 1;
            self.state = WindowState::Stable;
        }
    }

    /// `beats` then per tracked frequency
    /// `hz,idx,noize,avg,thresh,cur,sd,is_beat`, the column set read by the
    /// plotting script. `thresh` is the plain ratio threshold and `sd` the
    /// deviation threshold a value must exceed.
    fn trace_line(&self) -> String {
        let mut line = self.beat_count.to_string();
        for t in &self.tracked {
            let _ = write!(
                line,
                ",{},{},{:.2},{:.2},{:.2},{:.2},{:.2},{}",
                t.frequency_hz,
                t.target_bin,
                self.config.noise_threshold_factor * t.long_term_average,
                t.short_average,
                TRACE_RATIO_THRESHOLD * t.short_average,
                t.current_value,
                t.short_average + self.config.sd_multiplier * t.standard_deviation,
                t.is_beat as u8
            );
        }
        line
    }

    pub fn state(&self) -> BeatState {
        BeatState {
            is_beat: self.was_beat,
            beat_count: self.beat_count,
            window_len: self.window_len,
        }
    }

    #[cfg(test)]
    pub fn window_state(&self) -> WindowState {
        self.state
    }

    pub fn tracked(&self) -> &[TrackedBeatFreq] {
        &self.tracked
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    pub fn interval_ema_ms(&self) -> f32 {
        self.interval_ema_ms
    }

    pub fn resize_count(&self) -> u64 {
        self.resizes
    }
}

fn desired_window_len(config: &BeatConfig, interval_ms: f32) -> usize {
    let len = (config.target_history_ms / interval_ms).round();
    // Float to int casts saturate, so an absurd ratio still lands in range
    (len as usize).clamp(1, config.max_window_len.max(1))
}
