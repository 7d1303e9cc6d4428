use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{self, BufWriter, IsTerminal, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use super::record::{CycleRecord, RecordWriter};
use crate::audio::features::AnalysisResult;
use crate::config::OutputFormat;

/// Where analysis records go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkTarget {
    Stdout,
    File(PathBuf),
    /// Program and arguments; records are written to its stdin.
    Command(Vec<String>),
}

impl SinkTarget {
    /// `--pipe-to` wins over `--output`; `-` means stdout.
    pub fn from_args(output: &std::path::Path, pipe_to: Option<&str>) -> Result<Self> {
        if let Some(command) = pipe_to {
            let argv: Vec<String> = command.split_whitespace().map(String::from).collect();
            if argv.is_empty() {
                bail!("--pipe-to needs a command");
            }
            return Ok(SinkTarget::Command(argv));
        }
        if output.as_os_str() == "-" {
            Ok(SinkTarget::Stdout)
        } else {
            Ok(SinkTarget::File(output.to_path_buf()))
        }
    }
}

/// Record sink over stdout, a file, or a spawned renderer process.
pub struct ResultSink {
    writer: RecordWriter<Box<dyn Write + Send>>,
    child: Option<Child>,
    target: SinkTarget,
}

impl ResultSink {
    pub fn open(target: SinkTarget, mut format: OutputFormat) -> Result<Self> {
        let mut child = None;
        let out: Box<dyn Write + Send> = match &target {
            SinkTarget::Stdout => {
                let stdout = io::stdout();
                if format == OutputFormat::Binary && stdout.is_terminal() {
                    log::warn!("Refusing to write binary records to a terminal, logging beats instead");
                    format = OutputFormat::Log;
                }
                Box::new(stdout)
            }
            SinkTarget::File(path) => {
                let file = File::create(path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                Box::new(BufWriter::new(file))
            }
            SinkTarget::Command(argv) => {
                let mut spawned = Command::new(&argv[0])
                    .args(&argv[1..])
                    .stdin(Stdio::piped())
                    .stdout(Stdio::null())
                    // A full stderr pipe would stall the renderer mid-stream
                    .stderr(Stdio::inherit())
                    .spawn()
                    .with_context(|| format!("Failed to spawn renderer: {}", argv[0]))?;
                let stdin = spawned.stdin.take().context("Renderer stdin not available")?;
                child = Some(spawned);
                Box::new(stdin)
            }
        };

        log::info!("Writing {:?} records to {}", format, describe(&target));
        if format == OutputFormat::Binary {
            log::debug!("Binary result block is {} bytes", AnalysisResult::SIZE);
        }

        Ok(Self {
            writer: RecordWriter::new(out, format),
            child,
            target,
        })
    }

    pub fn write(&mut self, record: &CycleRecord<'_>) -> Result<()> {
        self.writer
            .write(record)
            .with_context(|| format!("Failed to write record to {}", describe(&self.target)))
    }

    pub fn finish(self) -> Result<()> {
        let records = self.writer.records();
        let mut out = self.writer.into_inner();
        if let Err(e) = out.flush() {
            // A renderer that already exited closes the pipe; its status says more
            if self.child.is_none() || e.kind() != io::ErrorKind::BrokenPipe {
                return Err(e).context("Failed to flush records");
            }
        }
        // Close the pipe so the renderer sees EOF
        drop(out);

        if let Some(mut child) = self.child {
            let status = child.wait().context("Failed to wait for renderer")?;
            if !status.success() {
                bail!("Renderer exited with {}", status);
            }
        }

        log::info!("Wrote {} records to {}", records, describe(&self.target));
        Ok(())
    }
}

fn describe(target: &SinkTarget) -> String {
    match target {
        SinkTarget::Stdout => "stdout".into(),
        SinkTarget::File(path) => path.display().to_string(),
        SinkTarget::Command(argv) => format!("`{}`", argv.join(" ")),
    }
}
