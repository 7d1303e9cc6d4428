use clap::Parser;
use std::path::PathBuf;

use crate::audio::pcm::MonoMode;
use crate::config::{Config, OutputFormat};

#[derive(Parser, Debug)]
#[command(
    name = "beatscope",
    about = "Live spectrum, band energy and beat analysis of raw stereo PCM"
)]
pub struct Cli {
    /// Raw interleaved f32 LE stereo input (file or FIFO). Reads stdin when omitted or "-"
    pub input: Option<PathBuf>,

    /// Output file for analysis records, "-" for stdout
    #[arg(short, long, default_value = "-")]
    pub output: PathBuf,

    /// Spawn this renderer command and write records to its stdin instead of --output
    #[arg(long)]
    pub pipe_to: Option<String>,

    /// Config file (default: ./beatscope.toml, then ~/.config/beatscope/config.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Record format
    #[arg(short, long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Analysis cycles per second
    #[arg(long)]
    pub fps: Option<u32>,

    /// FFT size (even)
    #[arg(short = 'n', long)]
    pub transform_size: Option<usize>,

    /// Sample rate of the incoming stream
    #[arg(short = 'r', long)]
    pub sample_rate: Option<u32>,

    /// How stereo is folded into the analysed signal
    #[arg(long, value_enum)]
    pub mono: Option<MonoMode>,

    /// Append the packed spectrum and peak-hold envelope to each record
    #[arg(long)]
    pub emit_spectrum: bool,

    /// Append the stereo PCM history to each record
    #[arg(long)]
    pub emit_pcm: bool,

    /// Stop after this many cycles
    #[arg(long)]
    pub cycles: Option<u64>,

    /// Stop once the input reaches end of file
    #[arg(long)]
    pub exit_on_eof: bool,

    /// Show a progress spinner on stderr
    #[arg(long)]
    pub progress: bool,
}

impl Cli {
    /// Flags that were given override the loaded config.
    pub fn apply_to(&self, cfg: &mut Config) {
        if let Some(format) = self.format {
            cfg.output.format = format;
        }
        if let Some(fps) = self.fps {
            cfg.output.fps = fps;
        }
        if let Some(size) = self.transform_size {
            cfg.spectrum.transform_size = size;
        }
        if let Some(rate) = self.sample_rate {
            cfg.stream.sample_rate = rate;
        }
        if let Some(mono) = self.mono {
            cfg.stream.mono = mono;
        }
        if self.emit_spectrum {
            cfg.output.spectrum = true;
        }
        if self.emit_pcm {
            cfg.output.pcm = true;
        }
    }
}
