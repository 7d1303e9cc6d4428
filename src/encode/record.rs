use bytemuck::{Pod, Zeroable};
use serde::Serialize;
use std::io::{self, Write};

use crate::audio::features::AnalysisResult;
use crate::config::OutputFormat;

/// Prefix of the optional spectrum blob, followed by `size` packed spectrum
/// floats and `size` peak-hold floats.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct SpectrumHeader {
    pub size: i32,
    pub dominant_period: i32,
}

/// Prefix of the optional PCM blob, followed by `capacity` left floats and
/// `capacity` right floats, oldest first.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PcmHeader {
    pub capacity: u32,
    pub _reserved: u32,
    pub total_written: u64,
}

/// Everything emitted for one cycle. Optional parts are present only when
/// enabled in the output config.
pub struct CycleRecord<'a> {
    pub cycle: u64,
    pub result: &'a AnalysisResult,
    pub spectrum: Option<SpectrumView<'a>>,
    pub pcm: Option<PcmView<'a>>,
}

#[derive(Clone, Copy, Serialize)]
pub struct SpectrumView<'a> {
    pub dominant_period: usize,
    pub packed: &'a [f32],
    pub peak_hold: &'a [f32],
}

#[derive(Clone, Copy, Serialize)]
pub struct PcmView<'a> {
    pub total_written: u64,
    pub left: &'a [f32],
    pub right: &'a [f32],
}

#[derive(Serialize)]
struct JsonLine<'a> {
    cycle: u64,
    #[serde(flatten)]
    result: &'a AnalysisResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    spectrum: Option<SpectrumView<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pcm: Option<PcmView<'a>>,
}

/// Serializes cycle records onto any byte sink.
pub struct RecordWriter<W: Write> {
    out: W,
    format: OutputFormat,
    records: u64,
    last_beat_count: i32,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self {
            out,
            format,
            records: 0,
            last_beat_count: 0,
        }
    }

    pub fn write(&mut self, record: &CycleRecord<'_>) -> io::Result<()> {
        match self.format {
            OutputFormat::Binary => self.write_binary(record)?,
            OutputFormat::Json => self.write_json(record)?,
            OutputFormat::Log => self.log_beat(record),
        }
        self.records += 1;
        Ok(())
    }

    fn write_binary(&mut self, record: &CycleRecord<'_>) -> io::Result<()> {
        self.out.write_all(record.result.as_bytes())?;

        if let Some(spectrum) = record.spectrum {
            let header = SpectrumHeader {
                size: spectrum.packed.len() as i32,
                dominant_period: spectrum.dominant_period as i32,
            };
            self.out.write_all(bytemuck::bytes_of(&header))?;
            self.out.write_all(bytemuck::cast_slice(spectrum.packed))?;
            self.out.write_all(bytemuck::cast_slice(spectrum.peak_hold))?;
        }

        if let Some(pcm) = record.pcm {
            let header = PcmHeader {
                capacity: pcm.left.len() as u32,
                _reserved: 0,
                total_written: pcm.total_written,
            };
            self.out.write_all(bytemuck::bytes_of(&header))?;
            self.out.write_all(bytemuck::cast_slice(pcm.left))?;
            self.out.write_all(bytemuck::cast_slice(pcm.right))?;
        }

        self.out.flush()
    }

    fn write_json(&mut self, record: &CycleRecord<'_>) -> io::Result<()> {
        let line = JsonLine {
            cycle: record.cycle,
            result: record.result,
            spectrum: record.spectrum,
            pcm: record.pcm,
        };
        serde_json::to_writer(&mut self.out, &line)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }

    fn log_beat(&mut self, record: &CycleRecord<'_>) {
        let result = record.result;
        if result.beat_count != self.last_beat_count {
            self.last_beat_count = result.beat_count;
            let loudest = result
                .bands
                .iter()
                .enumerate()
                .fold((0, f32::MIN), |best, (i, b)| if b.energy > best.1 { (i, b.energy) } else { best });
            log::info!(
                "Beat #{} at cycle {} (window {}, loudest band {}, period {} samples)",
                result.beat_count,
                record.cycle,
                result.window_len,
                loudest.0,
                result.dominant_period
            );
        }
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::features::BandRecord;

    fn sample_result() -> AnalysisResult {
        let mut result = AnalysisResult {
            is_beat: 1,
            beat_count: 3,
            dominant_period: 97,
            window_len: 500,
            ..Default::default()
        };
        result.bands[2] = BandRecord {
            energy: 12.5,
            ..Default::default()
        };
        result
    }

    #[test]
    fn binary_is_raw_result() {
        let result = sample_result();
        let mut writer = RecordWriter::new(Vec::new(), OutputFormat::Binary);
        let record = CycleRecord {
            cycle: 1,
            result: &result,
            spectrum: None,
            pcm: None,
        };
        writer.write(&record).unwrap();
        writer.write(&record).unwrap();

        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 2 * AnalysisResult::SIZE);
        assert_eq!(&bytes[..AnalysisResult::SIZE], result.as_bytes());
    }

    #[test]
    fn binary_appends_optional_blobs() {
        let result = sample_result();
        let packed = [1.0f32, 2.0, 3.0, 4.0];
        let peaks = [4.0f32, 3.0, 2.0, 1.0];
        let left = [0.5f32; 6];
        let right = [-0.5f32; 6];

        let mut writer = RecordWriter::new(Vec::new(), OutputFormat::Binary);
        writer
            .write(&CycleRecord {
                cycle: 1,
                result: &result,
                spectrum: Some(SpectrumView {
                    dominant_period: 2,
                    packed: &packed,
                    peak_hold: &peaks,
                }),
                pcm: Some(PcmView {
                    total_written: 10,
                    left: &left,
                    right: &right,
                }),
            })
            .unwrap();

        let bytes = writer.into_inner();
        let spectrum_at = AnalysisResult::SIZE;
        let pcm_at = spectrum_at + 8 + 2 * 4 * 4;
        assert_eq!(bytes.len(), pcm_at + 16 + 2 * 6 * 4);
        assert_eq!(&bytes[spectrum_at..spectrum_at + 4], &4i32.to_ne_bytes());
        assert_eq!(&bytes[spectrum_at + 8..spectrum_at + 12], &1.0f32.to_ne_bytes());
        assert_eq!(&bytes[pcm_at..pcm_at + 4], &6u32.to_ne_bytes());
        assert_eq!(&bytes[pcm_at + 8..pcm_at + 16], &10u64.to_ne_bytes());
    }

    #[test]
    fn json_is_one_object_per_line() {
        let result = sample_result();
        let mut writer = RecordWriter::new(Vec::new(), OutputFormat::Json);
        for cycle in 1..=2 {
            writer
                .write(&CycleRecord {
                    cycle,
                    result: &result,
                    spectrum: None,
                    pcm: None,
                })
                .unwrap();
        }
        assert_eq!(writer.records(), 2);

        let text = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let value: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(value["cycle"], 2);
        assert_eq!(value["is_beat"], 1);
        assert_eq!(value["beat_count"], 3);
        assert_eq!(value["bands"].as_array().unwrap().len(), 7);
        assert_eq!(value["bands"][2]["energy"], 12.5);
        assert!(value["bands"][2].get("_reserved").is_none());
        assert!(value.get("spectrum").is_none());
    }

    #[test]
    fn log_format_writes_nothing() {
        let result = sample_result();
        let mut writer = RecordWriter::new(Vec::new(), OutputFormat::Log);
        writer
            .write(&CycleRecord {
                cycle: 1,
                result: &result,
                spectrum: None,
                pcm: None,
            })
            .unwrap();
        assert_eq!(writer.records(), 1);
        assert!(writer.into_inner().is_empty());
    }
}
