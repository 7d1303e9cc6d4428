use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::audio::bands::{BAND_COUNT, DEFAULT_BOUNDARIES_HZ};
use crate::audio::pcm::MonoMode;
use crate::error::AnalysisError;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub spectrum: SpectrumConfig,
    #[serde(default)]
    pub bands: BandsConfig,
    #[serde(default)]
    pub beat: BeatConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize)]
pub struct StreamConfig {
    /// Assumed rate of the incoming stream; never negotiated.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Length of the PCM history ring.
    #[serde(default = "default_history_seconds")]
    pub history_seconds: f32,
    #[serde(default)]
    pub mono: MonoMode,
    #[serde(default = "default_idle_sleep_us")]
    pub idle_sleep_us: u64,
    #[serde(default = "default_read_chunk_frames")]
    pub read_chunk_frames: usize,
}

#[derive(Debug, Deserialize)]
pub struct SpectrumConfig {
    #[serde(default = "default_transform_size")]
    pub transform_size: usize,
    #[serde(default = "default_peak_decay")]
    pub peak_decay: f32,
}

#[derive(Debug, Deserialize)]
pub struct BandsConfig {
    #[serde(default = "default_boundaries_hz")]
    pub boundaries_hz: [f32; BAND_COUNT + 1],
    #[serde(default = "default_band_smoothing")]
    pub smoothing: f32,
}

/// Tuning of the adaptive beat detector.
#[derive(Clone, Debug, Deserialize)]
pub struct BeatConfig {
    /// Frequencies whose bins are tracked for beats.
    #[serde(default = "default_beat_frequencies")]
    pub frequencies_hz: Vec<f32>,
    /// Duration the short-term history should cover.
    #[serde(default = "default_target_history_ms")]
    pub target_history_ms: f32,
    /// Cycle interval assumed before any has been measured.
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: f32,
    #[serde(default = "default_interval_smoothing")]
    pub interval_smoothing: f32,
    /// Several minutes of time constant at frame rate.
    #[serde(default = "default_long_term_smoothing")]
    pub long_term_smoothing: f32,
    #[serde(default = "default_initial_long_term_average")]
    pub initial_long_term_average: f32,
    /// Short average must exceed this fraction of the long-term average.
    #[serde(default = "default_noise_threshold_factor")]
    pub noise_threshold_factor: f32,
    /// Standard deviations above the short average a value must reach.
    #[serde(default = "default_sd_multiplier")]
    pub sd_multiplier: f32,
    /// Relative window length drift that triggers a resize.
    #[serde(default = "default_resize_tolerance")]
    pub resize_tolerance: f32,
    #[serde(default = "default_max_window_len")]
    pub max_window_len: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Fixed-layout little-endian records
    #[default]
    Binary,
    /// One JSON object per line
    Json,
    /// Beat events in the log only
    Log,
}

#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// Analysis cycles per second.
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub format: OutputFormat,
    /// Also emit the packed spectrum and peak-hold envelope.
    #[serde(default)]
    pub spectrum: bool,
    /// Also emit the stereo PCM history.
    #[serde(default)]
    pub pcm: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            history_seconds: default_history_seconds(),
            mono: MonoMode::default(),
            idle_sleep_us: default_idle_sleep_us(),
            read_chunk_frames: default_read_chunk_frames(),
        }
    }
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            transform_size: default_transform_size(),
            peak_decay: default_peak_decay(),
        }
    }
}

impl Default for BandsConfig {
    fn default() -> Self {
        Self {
            boundaries_hz: default_boundaries_hz(),
            smoothing: default_band_smoothing(),
        }
    }
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            frequencies_hz: default_beat_frequencies(),
            target_history_ms: default_target_history_ms(),
            initial_interval_ms: default_initial_interval_ms(),
            interval_smoothing: default_interval_smoothing(),
            long_term_smoothing: default_long_term_smoothing(),
            initial_long_term_average: default_initial_long_term_average(),
            noise_threshold_factor: default_noise_threshold_factor(),
            sd_multiplier: default_sd_multiplier(),
            resize_tolerance: default_resize_tolerance(),
            max_window_len: default_max_window_len(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            format: OutputFormat::default(),
            spectrum: false,
            pcm: false,
        }
    }
}

fn default_sample_rate() -> u32 { 44100 }
fn default_history_seconds() -> f32 { 8.0 }
fn default_idle_sleep_us() -> u64 { 500 }
fn default_read_chunk_frames() -> usize { 2048 }
fn default_transform_size() -> usize { 2048 }
fn default_peak_decay() -> f32 { 0.95 }
fn default_boundaries_hz() -> [f32; BAND_COUNT + 1] { DEFAULT_BOUNDARIES_HZ }
fn default_band_smoothing() -> f32 { 0.02 }
fn default_beat_frequencies() -> Vec<f32> { vec![60.0, 75.0, 95.0] }
fn default_target_history_ms() -> f32 { 8000.0 }
fn default_initial_interval_ms() -> f32 { 16.0 }
fn default_interval_smoothing() -> f32 { 0.01 }
fn default_long_term_smoothing() -> f32 { 0.0001 }
fn default_initial_long_term_average() -> f32 { 1.0 }
fn default_noise_threshold_factor() -> f32 { 0.25 }
fn default_sd_multiplier() -> f32 { 2.4 }
fn default_resize_tolerance() -> f32 { 0.15 }
fn default_max_window_len() -> usize { 1 << 16 }
fn default_fps() -> u32 { 60 }

impl Config {
    /// Frames held by the PCM ring. Never shorter than one transform.
    pub fn history_capacity(&self) -> usize {
        let frames = (self.stream.sample_rate as f32 * self.stream.history_seconds).round() as usize;
        frames.max(self.spectrum.transform_size)
    }

    pub fn validate(&self) -> Result<(), AnalysisError> {
        let invalid = |msg: String| Err(AnalysisError::InvalidConfig(msg));

        let size = self.spectrum.transform_size;
        if size == 0 || size % 2 != 0 {
            return Err(AnalysisError::OddTransformSize(size));
        }
        if self.stream.sample_rate == 0 {
            return invalid("sample_rate must be positive".into());
        }
        if !(self.stream.history_seconds > 0.0) {
            return invalid("history_seconds must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.spectrum.peak_decay) {
            return invalid(format!("peak_decay {} outside 0..=1", self.spectrum.peak_decay));
        }
        if self
            .bands
            .boundaries_hz
            .windows(2)
            .any(|pair| !(pair[0] < pair[1]))
        {
            return invalid(format!(
                "band boundaries must be strictly increasing: {:?}",
                self.bands.boundaries_hz
            ));
        }

        let beat = &self.beat;
        if beat.frequencies_hz.is_empty() {
            return invalid("at least one beat frequency is required".into());
        }
        if beat.frequencies_hz.iter().any(|&hz| !(hz > 0.0)) {
            return invalid(format!("beat frequencies must be positive: {:?}", beat.frequencies_hz));
        }
        if !(beat.target_history_ms > 0.0) || !(beat.initial_interval_ms > 0.0) {
            return invalid("target_history_ms and initial_interval_ms must be positive".into());
        }
        let smoothing = [
            ("bands.smoothing", self.bands.smoothing),
            ("beat.interval_smoothing", beat.interval_smoothing),
            ("beat.long_term_smoothing", beat.long_term_smoothing),
        ];
        for (name, value) in smoothing {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{} {} outside 0..=1", name, value));
            }
        }
        if !(beat.resize_tolerance >= 0.0) {
            return invalid(format!("resize_tolerance {} must be non-negative", beat.resize_tolerance));
        }
        if !(beat.noise_threshold_factor >= 0.0) || !(beat.sd_multiplier >= 0.0) {
            return invalid("noise_threshold_factor and sd_multiplier must be non-negative".into());
        }
        if beat.max_window_len == 0 {
            return invalid("max_window_len must be at least 1".into());
        }
        if self.output.fps == 0 {
            return invalid("fps must be positive".into());
        }
        Ok(())
    }
}

/// Explicit path first, then `./beatscope.toml`, then the per-user config.
pub fn find_config(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| {
        let local = PathBuf::from("beatscope.toml");
        if local.exists() {
            return Some(local);
        }
        if let Some(home) = dirs::home_dir() {
            let xdg = home.join(".config").join("beatscope").join("config.toml");
            if xdg.exists() {
                return Some(xdg);
            }
        }
        if let Some(config_dir) = dirs::config_dir() {
            let platform = config_dir.join("beatscope").join("config.toml");
            if platform.exists() {
                return Some(platform);
            }
        }
        None
    })
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}
