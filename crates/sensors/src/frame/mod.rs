//! Wire layout of one controller frame.
//!
//! A frame is a fixed sequence of 16-bit little-endian words:
//!
//! 1. header magic (4 words) and timestamp (2 words, low word first)
//! 2. auxiliary results, slot-major then stream
//! 3. amplifier words, channel-major then stream; stimulation frames send a DC word
//!    before each AC word
//! 4. stimulation frames only: a repeat of aux slot 0 per stream, four flag words per
//!    stream (on, polarity, amp-settle, charge-recovery) and 8 DAC words
//! 5. filler, 8 ADC words, digital-in, digital-out

mod codec;

pub use codec::{FrameCodec, FrameSamples};

use neuro_types::{ControllerVariant, SensorError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("Bad frame header at word {offset}: expected {expected:#018x}, found {found:#018x}")]
    BadMagic {
        offset: usize,
        expected: u64,
        found: u64,
    },

    #[error("No frame alignment found within {searched} words")]
    ResyncFailed { searched: usize },

    #[error("Frame needs {needed} words, got {got}")]
    ShortFrame { needed: usize, got: usize },

    #[error("Sample layout mismatch: {0}")]
    LayoutMismatch(String),

    #[error(transparent)]
    Sensor(#[from] SensorError),
}

pub const HEADER_WORDS: usize = 4;
pub const TIMESTAMP_WORDS: usize = 2;
pub const ADC_CHANNELS: usize = 8;
pub const DAC_CHANNELS: usize = 8;
pub const STIM_FLAG_WORDS: usize = 4;

/// Word offsets within a frame for one variant and stream count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    variant: ControllerVariant,
    num_streams: usize,
}

impl FrameLayout {
    pub fn new(variant: ControllerVariant, num_streams: usize) -> Result<Self, SensorError> {
        if num_streams == 0 || num_streams > variant.max_streams() {
            return Err(SensorError::UnsupportedStreamCount {
                variant,
                requested: num_streams,
                max: variant.max_streams(),
            });
        }
        Ok(Self {
            variant,
            num_streams,
        })
    }

    pub fn variant(&self) -> ControllerVariant {
        self.variant
    }

    pub fn num_streams(&self) -> usize {
        self.num_streams
    }

    pub fn channels_per_stream(&self) -> usize {
        self.variant.channels_per_stream()
    }

    pub fn aux_slots(&self) -> usize {
        self.variant.aux_slots()
    }

    pub fn frames_per_block(&self) -> usize {
        self.variant.frames_per_block()
    }

    fn amp_words_per_channel(&self) -> usize {
        if self.variant.has_stimulation() {
            2
        } else {
            1
        }
    }

    pub const fn timestamp_offset(&self) -> usize {
        HEADER_WORDS
    }

    pub fn aux_offset(&self, slot: usize, stream: usize) -> usize {
        HEADER_WORDS + TIMESTAMP_WORDS + slot * self.num_streams + stream
    }

    fn amplifier_base(&self) -> usize {
        self.aux_offset(self.aux_slots(), 0)
    }

    fn amplifier_slot(&self, channel: usize, stream: usize) -> usize {
        self.amplifier_base() + (channel * self.num_streams + stream) * self.amp_words_per_channel()
    }

    /// Offset of the (AC-coupled) amplifier word.
    pub fn amplifier_offset(&self, channel: usize, stream: usize) -> usize {
        self.amplifier_slot(channel, stream) + self.amp_words_per_channel() - 1
    }

    /// Offset of the DC amplifier word, stimulation frames only.
    pub fn dc_amplifier_offset(&self, channel: usize, stream: usize) -> Option<usize> {
        self.variant
            .has_stimulation()
            .then(|| self.amplifier_slot(channel, stream))
    }

    fn after_amplifiers(&self) -> usize {
        self.amplifier_slot(self.channels_per_stream(), 0)
    }

    pub fn aux0_repeat_offset(&self, stream: usize) -> Option<usize> {
        self.variant
            .has_stimulation()
            .then(|| self.after_amplifiers() + stream)
    }

    /// `flag` is 0..4: on, polarity, amp-settle, charge-recovery.
    pub fn stim_flag_offset(&self, stream: usize, flag: usize) -> Option<usize> {
        self.variant.has_stimulation().then(|| {
            self.after_amplifiers() + self.num_streams + stream * STIM_FLAG_WORDS + flag
        })
    }

    pub fn dac_offset(&self, index: usize) -> Option<usize> {
        self.variant.has_stimulation().then(|| {
            self.after_amplifiers() + self.num_streams * (1 + STIM_FLAG_WORDS) + index
        })
    }

    fn filler_offset(&self) -> usize {
        if self.variant.has_stimulation() {
            self.after_amplifiers() + self.num_streams * (1 + STIM_FLAG_WORDS) + DAC_CHANNELS
        } else {
            self.after_amplifiers()
        }
    }

    pub fn filler_words(&self) -> usize {
        self.variant.filler_words(self.num_streams)
    }

    pub fn adc_offset(&self, index: usize) -> usize {
        self.filler_offset() + self.filler_words() + index
    }

    pub fn digital_in_offset(&self) -> usize {
        self.adc_offset(ADC_CHANNELS)
    }

    pub fn digital_out_offset(&self) -> usize {
        self.digital_in_offset() + 1
    }

    pub fn words_per_frame(&self) -> usize {
        self.digital_out_offset() + 1
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.words_per_frame() * 2
    }

    pub fn words_per_block(&self) -> usize {
        self.words_per_frame() * self.frames_per_block()
    }

    pub fn bytes_per_block(&self) -> usize {
        self.words_per_block() * 2
    }
}
