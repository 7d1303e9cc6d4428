use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::audio::bands::BandAnalyzer;
use crate::audio::beat::{BeatDetector, BeatState};
use crate::audio::features::AnalysisResult;
use crate::audio::pcm::SharedPcm;
use crate::audio::spectrum::{SpectralTransform, Spectrum};
use crate::config::Config;
use crate::error::Result;

/// One analysis step per rendered frame: snapshot the newest audio, run the
/// transform, update bands and beat statistics, then pack the result.
pub struct Analyzer {
    store: SharedPcm,
    transform: SpectralTransform,
    bands: BandAnalyzer,
    beat: BeatDetector,
    capture_length: usize,
    cycles: u64,
}

impl Analyzer {
    pub fn new(config: &Config, store: SharedPcm) -> Result<Self> {
        let size = config.spectrum.transform_size;
        let sample_rate = config.stream.sample_rate;

        let transform = SpectralTransform::new(size, config.stream.mono, config.spectrum.peak_decay)?;
        let bands = BandAnalyzer::new(
            &config.bands.boundaries_hz,
            sample_rate,
            size,
            config.bands.smoothing,
        );
        let beat = BeatDetector::new(&config.beat, sample_rate, size);
        let capture_length = transform.size();

        log::info!(
            "Analyzer: N={} @ {} Hz, history {} frames, beat window {} cycles",
            size,
            sample_rate,
            store.capacity(),
            beat.window_len()
        );
        log::debug!("Band bin ranges: {:?}", bands.ranges());

        Ok(Self {
            store,
            transform,
            bands,
            beat,
            capture_length,
            cycles: 0,
        })
    }

    /// Run a cycle timed by the wall clock.
    pub fn cycle(&mut self, now: Instant) -> Result<AnalysisResult> {
        self.analyze()?;
        let beat = self.beat.update(&self.transform, now);
        Ok(self.finish_cycle(beat))
    }

    /// Run a cycle as if `interval_ms` had passed since the previous one.
    #[cfg(test)]
    pub fn cycle_with_interval(&mut self, interval_ms: f32) -> Result<AnalysisResult> {
        self.analyze()?;
        let beat = self.beat.update_with_interval(&self.transform, interval_ms);
        Ok(self.finish_cycle(beat))
    }

    fn analyze(&mut self) -> Result<()> {
        self.transform.analyze(&self.store, self.capture_length)?;
        self.bands.update(&self.transform);
        Ok(())
    }

    fn finish_cycle(&mut self, beat: BeatState) -> AnalysisResult {
        self.cycles += 1;
        AnalysisResult::new(&beat, self.bands.metrics(), self.transform.dominant_period())
    }

    pub fn transform(&self) -> &SpectralTransform {
        &self.transform
    }

    #[cfg(test)]
    pub fn bands(&self) -> &BandAnalyzer {
        &self.bands
    }

    pub fn beat(&self) -> &BeatDetector {
        &self.beat
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    CycleLimit,
    EndOfInput,
}

/// Conditions that end the cycle loop, checked before every cycle.
pub struct RunControl {
    interrupted: Arc<AtomicBool>,
    cycle_limit: Option<u64>,
    exit_on_eof: bool,
}

impl RunControl {
    pub fn new(cycle_limit: Option<u64>, exit_on_eof: bool) -> Self {
        Self {
            interrupted: Arc::new(AtomicBool::new(false)),
            cycle_limit,
            exit_on_eof,
        }
    }

    /// Flag to raise from a signal handler.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    pub fn check(&self, cycles: u64, end_of_stream: bool) -> Option<StopReason> {
        if self.interrupted.load(Ordering::SeqCst) {
            Some(StopReason::Interrupted)
        } else if self.cycle_limit.is_some_and(|limit| cycles >= limit) {
            Some(StopReason::CycleLimit)
        } else if self.exit_on_eof && end_of_stream {
            Some(StopReason::EndOfInput)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;
    use std::io::Cursor;
    use std::time::{Duration, Instant};

    use crate::audio::ingest::{IngestOptions, IngestWorker};

    fn tone(freq: f32, sample_rate: f32, start: usize, len: usize, amplitude: f32) -> Vec<f32> {
        (start..start + len)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    fn small_config() -> Config {
        let mut config = Config::default();
        config.stream.history_seconds = 1.0;
        config
    }

    fn argmax(values: impl Iterator<Item = f32>) -> usize {
        values
            .enumerate()
            .fold((0, f32::MIN), |best, (i, v)| if v > best.1 { (i, v) } else { best })
            .0
    }

    #[test]
    fn tone_lands_in_low_mid_band() {
        let config = small_config();
        let store = SharedPcm::new(config.history_capacity()).unwrap();
        let samples = tone(440.0, 44100.0, 0, 44100, 0.5);
        store.write(&samples, &samples);

        let mut analyzer = Analyzer::new(&config, store).unwrap();
        let result = analyzer.cycle_with_interval(16.0).unwrap();

        let loudest = argmax(result.bands.iter().map(|b| b.energy));
        assert_eq!(loudest, 2);
        assert_eq!(analyzer.transform().dominant_bin(), 20);
        assert_eq!(result.dominant_period, 2048 / 21);
        assert_eq!(result.window_len, 500);
        assert_eq!(analyzer.cycles(), 1);
    }

    #[test]
    fn silence_produces_no_beats() {
        let config = small_config();
        let store = SharedPcm::new(config.history_capacity()).unwrap();
        let mut analyzer = Analyzer::new(&config, store).unwrap();

        for _ in 0..200 {
            let result = analyzer.cycle_with_interval(16.0).unwrap();
            assert_eq!(result.is_beat, 0);
            assert!(result.bands.iter().all(|b| b.energy == 0.0));
        }
        assert_eq!(analyzer.beat().state().beat_count, 0);
    }

    #[test]
    fn bass_hit_after_steady_floor_is_one_beat() {
        let config = small_config();
        let store = SharedPcm::new(config.history_capacity()).unwrap();
        let mut analyzer = Analyzer::new(&config, store.clone()).unwrap();

        // Quiet 60 Hz floor; nothing new arrives, so every cycle sees the same capture
        let floor = tone(60.0, 44100.0, 0, 4096, 0.05);
        store.write(&floor, &floor);
        for _ in 0..600 {
            let result = analyzer.cycle_with_interval(16.0).unwrap();
            assert_eq!(result.window_len, 500);
        }
        assert!(!analyzer.beat().state().is_beat);
        let before = analyzer.beat().state().beat_count;

        // Loud hit filling the whole capture, held for a few cycles
        let hit = tone(60.0, 44100.0, 4096, 4096, 1.0);
        store.write(&hit, &hit);
        for _ in 0..3 {
            let result = analyzer.cycle_with_interval(16.0).unwrap();
            assert_eq!(result.is_beat, 1);
        }
        assert_eq!(analyzer.beat().state().beat_count, before + 1);
        assert!(analyzer.bands().metrics()[1].accumulated_energy > 0.0);
    }

    #[test]
    fn ingest_feeds_analysis() {
        let config = small_config();
        let store = SharedPcm::new(config.history_capacity()).unwrap();

        let samples = tone(440.0, 44100.0, 0, 8192, 0.5);
        let bytes: Vec<u8> = samples
            .iter()
            .flat_map(|&s| {
                let mut frame = [0u8; 8];
                frame[..4].copy_from_slice(&s.to_le_bytes());
                frame[4..].copy_from_slice(&s.to_le_bytes());
                frame
            })
            .collect();

        let mut worker =
            IngestWorker::spawn(Cursor::new(bytes), store.clone(), IngestOptions::default()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !worker.stats().end_of_stream && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        let stats = worker.shutdown();
        assert!(stats.end_of_stream);
        assert_eq!(stats.frames, 8192);

        let mut analyzer = Analyzer::new(&config, store).unwrap();
        let result = analyzer.cycle(Instant::now()).unwrap();
        assert_eq!(argmax(result.bands.iter().map(|b| b.energy)), 2);
    }

    #[test]
    fn interrupt_wins_over_other_stop_conditions() {
        let control = RunControl::new(Some(10), true);
        assert_eq!(control.check(0, false), None);
        assert_eq!(control.check(10, false), Some(StopReason::CycleLimit));
        assert_eq!(control.check(3, true), Some(StopReason::EndOfInput));

        control.interrupt_flag().store(true, Ordering::SeqCst);
        assert_eq!(control.check(0, false), Some(StopReason::Interrupted));
        assert_eq!(control.check(10, true), Some(StopReason::Interrupted));
    }

    #[test]
    fn end_of_input_ignored_unless_requested() {
        let control = RunControl::new(None, false);
        assert_eq!(control.check(u64::MAX, true), None);
    }

    #[test]
    fn interrupt_from_other_thread_stops_loop_cleanly() {
        let config = small_config();
        let store = SharedPcm::new(config.history_capacity()).unwrap();
        let mut analyzer = Analyzer::new(&config, store).unwrap();
        let control = RunControl::new(None, false);

        let flag = control.interrupt_flag();
        let raiser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::SeqCst);
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        let reason = loop {
            if let Some(reason) = control.check(analyzer.cycles(), false) {
                break reason;
            }
            assert!(Instant::now() < deadline, "loop never saw the interrupt");
            analyzer.cycle_with_interval(16.0).unwrap();
            std::thread::sleep(Duration::from_millis(1));
        };
        raiser.join().unwrap();

        assert_eq!(reason, StopReason::Interrupted);
        assert!(analyzer.cycles() > 0);
    }
}
