//! The contract between the disk pump and whatever writes recording files.

use crate::error::PipelineResult;
use crate::waveform::{WaveformCatalog, WaveformReader};

/// Writes samples from one waveform reader to storage.
///
/// The disk pump calls these only at recording boundaries and once per chunk while
/// recording. `write_samples` covers time indices `start_offset..start_offset + n` of the
/// reader's current reservation; a negative `start_offset` reaches into retained history
/// and is how the pre-trigger span is saved.
pub trait SaveManager: Send + 'static {
    fn open_files(&mut self, reader: &WaveformReader) -> PipelineResult<()>;

    fn write_samples(
        &mut self,
        reader: &WaveformReader,
        n: usize,
        start_offset: isize,
    ) -> PipelineResult<()>;

    fn close_files(&mut self) -> PipelineResult<()>;

    /// Expected output size, for disk-space warnings.
    fn bytes_per_minute_estimate(&self, catalog: &WaveformCatalog, sample_rate_hz: f64) -> f64;
}
