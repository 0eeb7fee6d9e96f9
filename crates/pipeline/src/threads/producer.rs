use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use neuro_sensor::{RawBlockSource, SourceError, SourceStatus};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::sync::POLL_INTERVAL;
use crate::word_ring::WordWriter;

/// Moves raw bytes from the source into the word ring.
pub struct Producer {
    source: Box<dyn RawBlockSource>,
    words: WordWriter,
    max_burst_blocks: usize,
    bytes: Vec<u8>,
    /// Raised once a finite source has delivered everything.
    exhausted: Arc<AtomicBool>,
}

impl Producer {
    pub fn new(
        source: Box<dyn RawBlockSource>,
        words: WordWriter,
        max_burst_blocks: usize,
        exhausted: Arc<AtomicBool>,
    ) -> Self {
        let bytes = Vec::with_capacity(max_burst_blocks * source.layout().bytes_per_block());
        Self {
            source,
            words,
            max_burst_blocks,
            bytes,
            exhausted,
        }
    }

    /// Polls until `stop` is raised or the source runs dry.
    pub fn run(mut self, stop: &AtomicBool) -> PipelineResult<()> {
        self.source.start()?;
        info!("Producer started ({} live)", if self.source.is_live() { "is" } else { "not" });
        let result = self.poll_loop(stop);
        if let Err(e) = self.source.stop() {
            warn!("Failed to stop source cleanly: {}", e);
        }
        result
    }

    fn poll_loop(&mut self, stop: &AtomicBool) -> PipelineResult<()> {
        let words_per_block = self.source.layout().words_per_block();
        let live = self.source.is_live();
        while !stop.load(Ordering::Relaxed) {
            let ready = self.source.num_words_available()? / words_per_block;
            let mut blocks = ready.min(self.max_burst_blocks);
            if !live {
                blocks = blocks.min(self.words.free_words() / words_per_block);
            }
            if blocks == 0 {
                match self.source.status() {
                    SourceStatus::Exhausted if ready == 0 => {
                        info!("Source exhausted, producer finishing");
                        self.exhausted.store(true, Ordering::Release);
                        return Ok(());
                    }
                    SourceStatus::Error(message) => {
                        return Err(PipelineError::Source(SourceError::Disconnected(message)));
                    }
                    _ => {}
                }
                thread::sleep(POLL_INTERVAL);
                continue;
            }

            self.bytes.clear();
            let read = self.source.read_raw_blocks(blocks, &mut self.bytes)?;
            // An overrun is counted and logged by the ring; the burst is lost.
            if self.words.write(&self.bytes, read / 2).is_ok() {
                debug!("Producer moved {} blocks", blocks);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::PipelineStats;
    use crate::word_ring::{word_ring, WordRingConfig};
    use neuro_sensor::{FileReplaySource, FrameCodec, FrameLayout, FrameSamples};
    use neuro_types::ControllerVariant;
    use std::io::Write;

    #[test]
    fn offline_source_is_drained_without_overruns() {
        let layout = FrameLayout::new(ControllerVariant::Usb2Record, 1).unwrap();
        let codec = FrameCodec::new(layout);
        let mut bytes = Vec::new();
        let mut frame = FrameSamples::new(&layout);
        for t in 0..(12 * layout.frames_per_block()) as u32 {
            frame.timestamp = t;
            FrameCodec::words_to_bytes(&codec.encode(&frame).unwrap(), &mut bytes);
        }
        let path = std::env::temp_dir().join(format!("producer-test-{}.bin", std::process::id()));
        std::fs::File::create(&path).unwrap().write_all(&bytes).unwrap();

        let stats = Arc::new(PipelineStats::default());
        let wpb = layout.words_per_block();
        let (writer, mut reader) = word_ring(
            WordRingConfig {
                capacity_words: 5 * wpb,
                max_burst_words: 2 * wpb,
                max_read_words: wpb,
                words_per_frame: layout.words_per_frame(),
            },
            Arc::clone(&stats),
        )
        .unwrap();
        let exhausted = Arc::new(AtomicBool::new(false));
        let source = Box::new(FileReplaySource::open(&path, layout).unwrap());
        let producer = Producer::new(source, writer, 2, Arc::clone(&exhausted));
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || producer.run(&stop))
        };

        let mut timestamps = Vec::new();
        while timestamps.len() < 12 {
            match reader.try_pointer_read(wpb).unwrap() {
                Some(block) => {
                    timestamps.push(codec.timestamp(block).unwrap());
                    reader.release(wpb).unwrap();
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        }
        handle.join().unwrap().unwrap();
        std::fs::remove_file(&path).ok();

        let expected: Vec<u32> = (0..12).map(|b| (b * layout.frames_per_block()) as u32).collect();
        assert_eq!(timestamps, expected);
        assert!(exhausted.load(Ordering::Acquire));
        assert_eq!(stats.snapshot().overruns, 0);
        assert_eq!(stats.snapshot().words_produced, 12 * wpb as u64);
    }
}
