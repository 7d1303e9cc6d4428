mod audio;
mod cli;
mod config;
mod encode;
mod error;
mod pipeline;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use audio::ingest::{IngestOptions, IngestWorker};
use audio::pcm::SharedPcm;
use cli::Cli;
use config::Config;
use encode::record::{CycleRecord, PcmView, SpectrumView};
use encode::sink::{ResultSink, SinkTarget};
use pipeline::{Analyzer, RunControl, StopReason};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let mut cfg = match config::find_config(cli.config.clone()) {
        Some(path) => match config::load_config(&path) {
            Ok(cfg) => {
                log::info!("Loaded config from {}", path.display());
                cfg
            }
            Err(err) => {
                log::warn!("Failed to load config, using defaults: {:#}", err);
                Config::default()
            }
        },
        None => Config::default(),
    };
    cli.apply_to(&mut cfg);
    cfg.validate().context("Invalid configuration")?;

    log::info!("beatscope - live PCM analysis");
    log::info!(
        "Stream: {} Hz, {:.1}s history, mono={:?}",
        cfg.stream.sample_rate,
        cfg.stream.history_seconds,
        cfg.stream.mono
    );
    log::info!(
        "Analysis: N={} @ {} fps, tracking {:?} Hz",
        cfg.spectrum.transform_size,
        cfg.output.fps,
        cfg.beat.frequencies_hz
    );

    // 1. Shared history and ingest
    let store = SharedPcm::new(cfg.history_capacity())?;
    let source = audio::source::open_source(cli.input.as_deref())?;
    let mut worker = IngestWorker::spawn(
        source,
        store.clone(),
        IngestOptions {
            chunk_frames: cfg.stream.read_chunk_frames,
            idle_sleep: Duration::from_micros(cfg.stream.idle_sleep_us),
        },
    )?;

    // 2. Analysis and output
    let mut analyzer = Analyzer::new(&cfg, store.clone())?;
    let target = SinkTarget::from_args(&cli.output, cli.pipe_to.as_deref())?;
    let mut sink = ResultSink::open(target, cfg.output.format)?;

    let pb = if cli.progress {
        let pb = match cli.cycles {
            Some(limit) => {
                let pb = ProgressBar::new(limit);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} cycles {msg}")?
                        .progress_chars("=>-"),
                );
                pb
            }
            None => {
                let pb = ProgressBar::new_spinner();
                pb.set_style(ProgressStyle::default_spinner().template("{spinner} [{elapsed_precise}] {pos} cycles {msg}")?);
                pb
            }
        };
        Some(pb)
    } else {
        None
    };

    // 3. Cycle loop at the configured frame rate
    let control = RunControl::new(cli.cycles, cli.exit_on_eof);
    let interrupted = control.interrupt_flag();
    ctrlc::set_handler(move || {
        // A second signal while shutting down gives up on a clean exit
        if interrupted.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
    })
    .context("Failed to install signal handler")?;

    let tick = Duration::from_secs_f64(1.0 / cfg.output.fps as f64);
    let mut next_tick = Instant::now();

    loop {
        if let Some(reason) = control.check(analyzer.cycles(), worker.stats().end_of_stream) {
            match reason {
                StopReason::Interrupted => log::info!("Interrupted, shutting down"),
                StopReason::CycleLimit => log::info!("Cycle limit reached"),
                StopReason::EndOfInput => log::info!("Input exhausted, stopping"),
            }
            break;
        }

        let result = analyzer.cycle(Instant::now())?;

        let stereo = cfg.output.pcm.then(|| store.snapshot_stereo());
        let transform = analyzer.transform();
        let record = CycleRecord {
            cycle: analyzer.cycles(),
            result: &result,
            spectrum: cfg.output.spectrum.then(|| SpectrumView {
                dominant_period: transform.dominant_period(),
                packed: transform.spectrum(),
                peak_hold: transform.peak_hold(),
            }),
            pcm: stereo.as_ref().map(|(left, right)| PcmView {
                total_written: store.total_written(),
                left,
                right,
            }),
        };
        sink.write(&record)?;

        if let Some(ref pb) = pb {
            pb.set_position(analyzer.cycles());
            if analyzer.cycles() % 30 == 0 {
                pb.set_message(format!(
                    "| beats {} | window {}",
                    result.beat_count, result.window_len
                ));
            }
        }

        next_tick += tick;
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        } else {
            // Running behind; do not try to catch up with a burst of cycles
            next_tick = now;
        }
    }

    if let Some(pb) = pb {
        pb.finish_with_message("done");
    }

    // 4. Shutdown
    let stats = worker.shutdown();
    let beat = analyzer.beat();
    log::info!(
        "Analysed {} cycles: {} beats, window {} cycles ({} resizes), interval {:.2}ms",
        analyzer.cycles(),
        beat.state().beat_count,
        beat.window_len(),
        beat.resize_count(),
        beat.interval_ema_ms()
    );
    for t in beat.tracked() {
        log::debug!(
            "{} Hz (bin {}): short avg {:.3}, sd {:.3}, long-term avg {:.3}",
            t.frequency_hz(),
            t.target_bin(),
            t.short_average(),
            t.standard_deviation(),
            t.long_term_average()
        );
    }
    if stats.read_errors > 0 {
        log::warn!("{} input read errors", stats.read_errors);
    }
    sink.finish()?;

    Ok(())
}
