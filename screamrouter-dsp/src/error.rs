use thiserror::Error;

/// Errors raised by the sample-level DSP primitives. These are always local,
/// per-chunk failures — callers decide whether to bypass the stage or drop the chunk.
#[derive(Debug, Error)]
pub enum DspError {
    #[error("resampler error: {0}")]
    Resample(String),

    #[error("unsupported channel count: {0}")]
    UnsupportedChannelCount(usize),

    #[error("buffer size mismatch: expected {expected}, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },
}
