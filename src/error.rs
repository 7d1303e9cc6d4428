use thiserror::Error;

/// Errors raised by the analysis core.
///
/// Construction errors are fatal for the pipeline; everything that happens
/// per cycle is either clamped or reported through `SnapshotTooLong`.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("transform size must be a non-zero even number, got {0}")]
    OddTransformSize(usize),

    #[error("PCM history capacity must be greater than zero")]
    ZeroCapacity,

    #[error("requested snapshot of {requested} samples exceeds PCM capacity of {capacity}")]
    SnapshotTooLong { requested: usize, capacity: usize },

    #[error("capture length {requested} must be between 2 and the transform size {size}")]
    CaptureTooLong { requested: usize, size: usize },

    #[error("failed to spawn ingest thread")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
