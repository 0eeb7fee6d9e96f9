use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info};

use crate::error::PipelineResult;
use crate::waveform::WaveformReader;

/// A consumer driven by a [`ReaderPump`].
pub trait ReaderSink: Send + 'static {
    /// Called once before the first chunk.
    fn start(&mut self, _reader: &WaveformReader) -> PipelineResult<()> {
        Ok(())
    }

    /// Handles time indices `0..n` of the reader's reservation.
    fn consume(&mut self, reader: &WaveformReader, n: usize) -> PipelineResult<()>;

    /// Called once after the last chunk, including when the pump stops on an error.
    fn finish(&mut self, _reader: &WaveformReader) -> PipelineResult<()> {
        Ok(())
    }
}

/// Reserves, hands to the sink and releases one chunk at a time.
pub struct ReaderPump {
    reader: WaveformReader,
    sink: Box<dyn ReaderSink>,
    chunk: usize,
}

impl ReaderPump {
    pub fn new(reader: WaveformReader, sink: Box<dyn ReaderSink>, chunk: usize) -> Self {
        Self {
            reader,
            sink,
            chunk,
        }
    }

    pub fn name(&self) -> &str {
        self.reader.name()
    }

    pub fn run(mut self, stop: &AtomicBool) -> PipelineResult<()> {
        info!("Reader pump '{}' started", self.reader.name());
        let result = self
            .sink
            .start(&self.reader)
            .and_then(|()| self.pump(stop));
        let finished = self.sink.finish(&self.reader);
        if let Err(e) = &finished {
            error!("Reader '{}' failed to finish: {}", self.reader.name(), e);
        }
        info!("Reader pump '{}' finished", self.reader.name());
        result.and(finished)
    }

    fn pump(&mut self, stop: &AtomicBool) -> PipelineResult<()> {
        while self.reader.reserve_read_until(self.chunk, stop)? {
            self.sink.consume(&self.reader, self.chunk)?;
            self.reader.release()?;
        }
        if stop.load(Ordering::Relaxed) || !self.reader.writer_finished() {
            return Ok(());
        }
        let rest = self.reader.available();
        if rest > 0 && self.reader.reserve_read(rest)? {
            self.sink.consume(&self.reader, rest)?;
            self.reader.release()?;
        }
        info!(
            "Reader pump '{}' drained to sample {}",
            self.reader.name(),
            self.reader.position()
        );
        Ok(())
    }
}
