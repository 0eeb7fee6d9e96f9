//! Common types and traits for raw block sources

use neuro_types::SensorError;
use thiserror::Error;

use crate::frame::{FrameError, FrameLayout};

/// Status of a raw block source
#[derive(Debug, Clone, PartialEq)]
pub enum SourceStatus {
    /// Source is constructed but not streaming
    Stopped,
    /// Source is actively producing blocks
    Running,
    /// A finite source has delivered everything it holds
    Exhausted,
    /// Source encountered an error
    Error(String),
}

/// Errors that can occur in raw block sources
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("Sensor error: {0}")]
    SensorError(#[from] SensorError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    /// The device went away mid-stream
    #[error("Source disconnected: {0}")]
    Disconnected(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("Source not started")]
    NotStarted,
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        SourceError::IoError(err.to_string())
    }
}

/// A device (or stand-in) that delivers whole USB blocks of little-endian wire bytes.
pub trait RawBlockSource: Send + 'static {
    /// Frame layout of the bytes this source produces.
    fn layout(&self) -> FrameLayout;

    fn start(&mut self) -> Result<(), SourceError>;

    /// 16-bit words that can be read right now without blocking.
    fn num_words_available(&mut self) -> Result<usize, SourceError>;

    /// Appends `blocks` whole USB blocks to `out` and returns the bytes appended.
    ///
    /// Callers only request what `num_words_available` reported.
    fn read_raw_blocks(&mut self, blocks: usize, out: &mut Vec<u8>) -> Result<usize, SourceError>;

    fn status(&self) -> SourceStatus;

    /// Live sources keep producing whether or not they are read; a full ring loses data.
    /// Offline sources can simply wait for room.
    fn is_live(&self) -> bool {
        true
    }

    fn stop(&mut self) -> Result<(), SourceError>;
}
