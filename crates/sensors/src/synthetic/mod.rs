//! A source that synthesizes controller blocks, for running without hardware.

mod generator;

pub use generator::SignalGenerator;

use std::time::Instant;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::frame::{FrameCodec, FrameLayout};
use crate::source::{RawBlockSource, SourceError, SourceStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Standard deviation of background noise.
    #[serde(default = "default_noise")]
    pub noise_uv: f32,
    #[serde(default = "default_line_noise")]
    pub line_noise_uv: f32,
    #[serde(default = "default_line_hz")]
    pub line_hz: f32,
    /// Mean spikes per second on each amplifier.
    #[serde(default = "default_spike_rate")]
    pub spike_rate_hz: f32,
    /// Trough depth of the spike template.
    #[serde(default = "default_spike_amplitude")]
    pub spike_amplitude_uv: f32,
    /// Digital line 0 pulses high for the first tenth of each period.
    #[serde(default = "default_trigger_period")]
    pub trigger_period_s: f64,
    /// Deliver blocks at the real sample rate instead of as fast as they are read.
    #[serde(default = "default_paced")]
    pub paced: bool,
}

fn default_seed() -> u64 {
    1
}
fn default_noise() -> f32 {
    5.0
}
fn default_line_noise() -> f32 {
    10.0
}
fn default_line_hz() -> f32 {
    60.0
}
fn default_spike_rate() -> f32 {
    20.0
}
fn default_spike_amplitude() -> f32 {
    250.0
}
fn default_trigger_period() -> f64 {
    1.0
}
fn default_paced() -> bool {
    true
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            noise_uv: default_noise(),
            line_noise_uv: default_line_noise(),
            line_hz: default_line_hz(),
            spike_rate_hz: default_spike_rate(),
            spike_amplitude_uv: default_spike_amplitude(),
            trigger_period_s: default_trigger_period(),
            paced: default_paced(),
        }
    }
}

/// Blocks an unpaced source reports as ready on each poll.
const UNPACED_READY_BLOCKS: u64 = 4;

pub struct SyntheticSource {
    codec: FrameCodec,
    generator: SignalGenerator,
    sample_rate: f64,
    paced: bool,
    status: SourceStatus,
    started_at: Option<Instant>,
    blocks_delivered: u64,
    frame_words: Vec<u16>,
}

impl SyntheticSource {
    pub fn new(
        layout: FrameLayout,
        sample_rate: f64,
        config: SyntheticConfig,
    ) -> Result<Self, SourceError> {
        if !(sample_rate > 0.0) {
            return Err(SourceError::ConfigurationError(format!(
                "sample rate must be positive, got {}",
                sample_rate
            )));
        }
        let paced = config.paced;
        let generator = SignalGenerator::new(layout, sample_rate as f32, config)?;
        info!(
            "SyntheticSource created: {} with {} streams at {} Hz",
            layout.variant(),
            layout.num_streams(),
            sample_rate
        );
        Ok(Self {
            codec: FrameCodec::new(layout),
            generator,
            sample_rate,
            paced,
            status: SourceStatus::Stopped,
            started_at: None,
            blocks_delivered: 0,
            frame_words: vec![0; layout.words_per_frame()],
        })
    }

    fn blocks_ready(&self) -> u64 {
        let Some(started) = self.started_at else {
            return 0;
        };
        if !self.paced {
            return UNPACED_READY_BLOCKS;
        }
        let frames_due = started.elapsed().as_secs_f64() * self.sample_rate;
        let blocks_due = (frames_due / self.codec.layout().frames_per_block() as f64) as u64;
        blocks_due.saturating_sub(self.blocks_delivered)
    }
}

impl RawBlockSource for SyntheticSource {
    fn layout(&self) -> FrameLayout {
        *self.codec.layout()
    }

    fn start(&mut self) -> Result<(), SourceError> {
        self.started_at = Some(Instant::now());
        self.blocks_delivered = 0;
        self.status = SourceStatus::Running;
        debug!("SyntheticSource started");
        Ok(())
    }

    fn num_words_available(&mut self) -> Result<usize, SourceError> {
        if self.status != SourceStatus::Running {
            return Err(SourceError::NotStarted);
        }
        Ok(self.blocks_ready() as usize * self.codec.layout().words_per_block())
    }

    fn read_raw_blocks(&mut self, blocks: usize, out: &mut Vec<u8>) -> Result<usize, SourceError> {
        if self.status != SourceStatus::Running {
            return Err(SourceError::NotStarted);
        }
        let start = out.len();
        let frames = blocks * self.codec.layout().frames_per_block();
        out.reserve(frames * self.codec.layout().bytes_per_frame());
        for _ in 0..frames {
            let frame = self.generator.next_frame();
            self.codec.encode_into(frame, &mut self.frame_words)?;
            FrameCodec::words_to_bytes(&self.frame_words, out);
        }
        self.blocks_delivered += blocks as u64;
        Ok(out.len() - start)
    }

    fn status(&self) -> SourceStatus {
        self.status.clone()
    }

    fn is_live(&self) -> bool {
        self.paced
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        self.status = SourceStatus::Stopped;
        self.started_at = None;
        info!(
            "SyntheticSource stopped after {} blocks",
            self.blocks_delivered
        );
        Ok(())
    }
}
