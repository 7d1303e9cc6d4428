//! Background thread turning a raw interleaved `f32` LE stereo byte stream
//! into frames in the shared PCM history.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::pcm::SharedPcm;
use crate::error::{AnalysisError, Result};

/// One left + right pair of little-endian `f32`.
pub const FRAME_BYTES: usize = 8;

/// Anything the worker can poll for bytes.
///
/// Implementations should not block: `Err(WouldBlock)` and `Ok(0)` both mean
/// "nothing right now" to the worker. `Ok(0)` additionally marks end of stream.
pub trait ByteSource: Send {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<R: Read + Send> ByteSource for R {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }
}

/// Reassembles whole frames from arbitrarily split reads.
pub struct FrameAssembler {
    buffer: Vec<u8>,
    filled: usize,
    left: Vec<f32>,
    right: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(chunk_frames: usize) -> Self {
        let chunk_frames = chunk_frames.max(1);
        Self {
            buffer: vec![0; chunk_frames * FRAME_BYTES],
            filled: 0,
            left: Vec::with_capacity(chunk_frames),
            right: Vec::with_capacity(chunk_frames),
        }
    }

    /// Free space after the carried-over bytes. Never empty once frames have
    /// been drained, since at most `FRAME_BYTES - 1` bytes are carried.
    pub fn spare(&mut self) -> &mut [u8] {
        &mut self.buffer[self.filled..]
    }

    /// Mark `n` bytes written into [`spare`](Self::spare) as valid.
    pub fn commit(&mut self, n: usize) {
        self.filled = (self.filled + n).min(self.buffer.len());
    }

    /// Copy as much of `bytes` as fits; returns the number of bytes taken.
    #[cfg(test)]
    pub fn extend(&mut self, bytes: &[u8]) -> usize {
        let spare = self.spare();
        let n = spare.len().min(bytes.len());
        spare[..n].copy_from_slice(&bytes[..n]);
        self.commit(n);
        n
    }

    /// Bytes of an incomplete frame waiting for the next read.
    #[cfg(test)]
    pub fn leftover(&self) -> usize {
        self.filled
    }

    /// Deinterleave every complete frame and move the partial tail to the
    /// front of the buffer.
    pub fn drain_frames(&mut self) -> (&[f32], &[f32]) {
        self.left.clear();
        self.right.clear();

        let consumed = self.filled / FRAME_BYTES * FRAME_BYTES;
        for frame in self.buffer[..consumed].chunks_exact(FRAME_BYTES) {
            if let &[l0, l1, l2, l3, r0, r1, r2, r3] = frame {
                self.left.push(f32::from_le_bytes([l0, l1, l2, l3]));
                self.right.push(f32::from_le_bytes([r0, r1, r2, r3]));
            }
        }

        self.buffer.copy_within(consumed..self.filled, 0);
        self.filled -= consumed;
        (&self.left, &self.right)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestState {
    Idle,
    Running,
    StopRequested,
    Joined,
}

#[derive(Clone, Copy, Debug)]
pub struct IngestOptions {
    /// Scratch buffer size in frames.
    pub chunk_frames: usize,
    /// Pause after a read that produced nothing. Zero spins.
    pub idle_sleep: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            chunk_frames: 2048,
            idle_sleep: Duration::from_micros(500),
        }
    }
}

#[derive(Default)]
struct IngestCounters {
    frames: AtomicU64,
    bytes: AtomicU64,
    read_errors: AtomicU64,
    end_of_stream: AtomicBool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub frames: u64,
    pub bytes: u64,
    pub read_errors: u64,
    pub end_of_stream: bool,
}

/// Owns the ingest thread. Dropping the worker stops and joins it.
pub struct IngestWorker {
    state: IngestState,
    stop: Arc<AtomicBool>,
    counters: Arc<IngestCounters>,
    handle: Option<JoinHandle<()>>,
}

impl IngestWorker {
    pub fn spawn<S>(source: S, store: SharedPcm, options: IngestOptions) -> Result<Self>
    where
        S: ByteSource + 'static,
    {
        let mut worker = Self {
            state: IngestState::Idle,
            stop: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(IngestCounters::default()),
            handle: None,
        };

        let stop = Arc::clone(&worker.stop);
        let counters = Arc::clone(&worker.counters);
        let handle = thread::Builder::new()
            .name("pcm-ingest".into())
            .spawn(move || run(source, store, &stop, &counters, options))
            .map_err(AnalysisError::ThreadSpawn)?;

        worker.handle = Some(handle);
        worker.state = IngestState::Running;
        log::info!(
            "Ingest worker started (chunk={} frames, idle sleep={:?})",
            options.chunk_frames,
            options.idle_sleep
        );
        Ok(worker)
    }

    #[cfg(test)]
    pub fn state(&self) -> IngestState {
        self.state
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            frames: self.counters.frames.load(Ordering::Relaxed),
            bytes: self.counters.bytes.load(Ordering::Relaxed),
            read_errors: self.counters.read_errors.load(Ordering::Relaxed),
            end_of_stream: self.counters.end_of_stream.load(Ordering::Relaxed),
        }
    }

    /// Request stop and join. Only the first call does any work.
    pub fn shutdown(&mut self) -> IngestStats {
        if self.state == IngestState::Running {
            self.stop.store(true, Ordering::Release);
            self.state = IngestState::StopRequested;
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Ingest thread panicked");
            }
            self.state = IngestState::Joined;
            let stats = self.stats();
            log::info!(
                "Ingest worker stopped: {} frames, {} bytes, {} read errors",
                stats.frames,
                stats.bytes,
                stats.read_errors
            );
        }
        self.stats()
    }
}

impl Drop for IngestWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<S: ByteSource>(
    mut source: S,
    store: SharedPcm,
    stop: &AtomicBool,
    counters: &IngestCounters,
    options: IngestOptions,
) {
    let mut assembler = FrameAssembler::new(options.chunk_frames);

    while !stop.load(Ordering::Acquire) {
        let read = match source.read_available(assembler.spare()) {
            Ok(0) => {
                if !counters.end_of_stream.swap(true, Ordering::Relaxed) {
                    log::warn!("Input stream reached end of file");
                }
                0
            }
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => 0,
            Err(e) => {
                if counters.read_errors.fetch_add(1, Ordering::Relaxed) == 0 {
                    log::warn!("Input read failed, continuing: {}", e);
                } else {
                    log::debug!("Input read failed: {}", e);
                }
                0
            }
        };

        if read == 0 {
            if !options.idle_sleep.is_zero() {
                thread::sleep(options.idle_sleep);
            }
            continue;
        }

        assembler.commit(read);
        counters.bytes.fetch_add(read as u64, Ordering::Relaxed);

        let (left, right) = assembler.drain_frames();
        if !left.is_empty() {
            store.write(left, right);
            counters.frames.fetch_add(left.len() as u64, Ordering::Relaxed);
        }
    }
}
