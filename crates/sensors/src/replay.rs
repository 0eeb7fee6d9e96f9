//! Replays a raw capture of controller wire bytes from disk.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::frame::FrameLayout;
use crate::source::{RawBlockSource, SourceError, SourceStatus};

/// Blocks offered per poll; replay is as fast as the pipeline drains it.
const BLOCKS_PER_POLL: usize = 4;

pub struct FileReplaySource {
    path: PathBuf,
    layout: FrameLayout,
    reader: Option<BufReader<File>>,
    remaining_bytes: u64,
    status: SourceStatus,
}

impl FileReplaySource {
    pub fn open(path: impl AsRef<Path>, layout: FrameLayout) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let len = std::fs::metadata(&path)?.len();
        let block = layout.bytes_per_block() as u64;
        if len % block != 0 {
            warn!(
                "{} holds {} trailing bytes that do not form a whole block; they will be skipped",
                path.display(),
                len % block
            );
        }
        info!(
            "Replaying {} ({} blocks of {})",
            path.display(),
            len / block,
            layout.variant()
        );
        Ok(Self {
            path,
            layout,
            reader: None,
            remaining_bytes: len - len % block,
            status: SourceStatus::Stopped,
        })
    }

    fn remaining_blocks(&self) -> usize {
        (self.remaining_bytes / self.layout.bytes_per_block() as u64) as usize
    }
}

impl RawBlockSource for FileReplaySource {
    fn layout(&self) -> FrameLayout {
        self.layout
    }

    fn start(&mut self) -> Result<(), SourceError> {
        self.reader = Some(BufReader::new(File::open(&self.path)?));
        self.status = SourceStatus::Running;
        Ok(())
    }

    fn num_words_available(&mut self) -> Result<usize, SourceError> {
        if self.reader.is_none() {
            return Err(SourceError::NotStarted);
        }
        let blocks = self.remaining_blocks().min(BLOCKS_PER_POLL);
        if blocks == 0 && self.status == SourceStatus::Running {
            info!("Replay of {} finished", self.path.display());
            self.status = SourceStatus::Exhausted;
        }
        Ok(blocks * self.layout.words_per_block())
    }

    fn read_raw_blocks(&mut self, blocks: usize, out: &mut Vec<u8>) -> Result<usize, SourceError> {
        let blocks = blocks.min(self.remaining_blocks());
        let reader = self.reader.as_mut().ok_or(SourceError::NotStarted)?;
        let n = blocks * self.layout.bytes_per_block();
        let start = out.len();
        out.resize(start + n, 0);
        reader.read_exact(&mut out[start..])?;
        self.remaining_bytes -= n as u64;
        Ok(n)
    }

    fn status(&self) -> SourceStatus {
        self.status.clone()
    }

    fn is_live(&self) -> bool {
        false
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        self.reader = None;
        self.status = SourceStatus::Stopped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameCodec, FrameSamples};
    use neuro_types::ControllerVariant;
    use std::io::Write;

    #[test]
    fn replays_capture_byte_for_byte() {
        let layout = FrameLayout::new(ControllerVariant::Usb3Record, 1).unwrap();
        let codec = FrameCodec::new(layout);
        let mut bytes = Vec::new();
        let mut frame = FrameSamples::new(&layout);
        for t in 0..(3 * layout.frames_per_block()) as u32 {
            frame.timestamp = t;
            FrameCodec::words_to_bytes(&codec.encode(&frame).unwrap(), &mut bytes);
        }
        // A partial trailing block is ignored.
        let mut file_bytes = bytes.clone();
        file_bytes.extend_from_slice(&[0xaa; 10]);

        let path = std::env::temp_dir().join(format!("replay-{}.dat", std::process::id()));
        File::create(&path).unwrap().write_all(&file_bytes).unwrap();

        let mut source = FileReplaySource::open(&path, layout).unwrap();
        source.start().unwrap();
        assert_eq!(source.num_words_available().unwrap(), 3 * layout.words_per_block());

        let mut read = Vec::new();
        source.read_raw_blocks(2, &mut read).unwrap();
        source.read_raw_blocks(5, &mut read).unwrap();
        assert_eq!(read, bytes);
        assert_eq!(source.num_words_available().unwrap(), 0);
        assert_eq!(source.status(), SourceStatus::Exhausted);

        std::fs::remove_file(&path).ok();
    }
}
