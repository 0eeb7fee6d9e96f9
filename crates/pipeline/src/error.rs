//! Error types for the acquisition pipeline

use neuro_sensor::{FrameError, SourceError};
use neuro_types::SensorError;
use thiserror::Error;

/// Pipeline-specific error types
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    #[error("Failed to allocate {bytes} bytes for {what}")]
    Allocation { what: &'static str, bytes: usize },

    #[error("Word ring error: {0}")]
    WordRing(#[from] WordRingError),

    #[error("Waveform ring error: {0}")]
    Waveform(#[from] WaveformError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),

    #[error("Thread '{name}' failed: {message}")]
    ThreadFailed { name: String, message: String },

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Generic error: {0}")]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        PipelineError::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        PipelineError::InvalidConfiguration {
            message: message.into(),
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors from the raw word ring between the producer and the transformer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WordRingError {
    #[error("overrun: {requested} words requested, {free} free")]
    Overrun { requested: usize, free: usize },
    #[error("underrun: {requested} words requested, {available} available")]
    Underrun { requested: usize, available: usize },
    #[error("read of {requested} words exceeds the {max}-word staging buffer")]
    ReadTooLarge { requested: usize, max: usize },
    #[error("input holds {bytes} bytes but {words} words were requested")]
    ShortInput { bytes: usize, words: usize },
}

/// Errors from the published waveform ring.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaveformError {
    #[error("unknown waveform '{0}'")]
    UnknownWaveform(String),
    #[error("sample offset {t} outside [{min}, {max})")]
    OutOfRange { t: isize, min: isize, max: isize },
    #[error("write of {requested} samples exceeds the {max}-sample burst limit")]
    WriteTooLarge { requested: usize, max: usize },
    #[error("read of {requested} samples can never be satisfied with {limit} readable")]
    ReadTooLarge { requested: usize, limit: usize },
    #[error("no {0} reservation is open")]
    NoReservation(&'static str),
    #[error("a {0} reservation is already open")]
    ReservationOpen(&'static str),
}

/// Errors raised by a processing backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("{backend} backend unavailable: {reason}")]
    Unavailable { backend: &'static str, reason: String },
    #[error("block of {got} does not match the configured size {expected}")]
    BlockSize { expected: usize, got: usize },
    #[error("{backend} backend failed: {reason}")]
    Execution { backend: &'static str, reason: String },
    #[error("channel index {index} out of range ({count} channels)")]
    ChannelOutOfRange { index: usize, count: usize },
}
