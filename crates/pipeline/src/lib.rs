//! Real-time acquisition pipeline for multi-channel neural recordings
//!
//! Raw controller words flow from a [`RawBlockSource`](neuro_sensor::RawBlockSource)
//! through a lock-free word ring to the transformer, which filters every amplifier
//! channel, detects and classifies spikes, and publishes all waveforms into a
//! multi-reader ring. Disk, display and other consumers each read that ring at their
//! own pace through a named reader.

pub mod allocator;
pub mod backend;
pub mod dsp;
pub mod error;
pub mod executor;
pub mod save;
pub mod spike;
pub mod stats;
pub mod sync;
pub mod threads;
pub mod waveform;
pub mod word_ring;


// Re-export commonly used types
pub use backend::{Backend, BackendKind, BackendSetup, BlockOutput, EngineCommand};
pub use error::*;
pub use executor::{EngineControl, Executor, ExecutorOptions, NamedSink};
pub use save::SaveManager;
pub use stats::{PipelineStats, StatsSnapshot};
pub use threads::{DiskRecorder, ReaderPump, ReaderSink, Trigger};
pub use waveform::{waveform_ring, WaveformCatalog, WaveformId, WaveformReader, WaveformWriter};
pub use word_ring::{word_ring, WordReader, WordRingConfig, WordWriter};
