//! Configuration types for the acquisition system

use serde::{Deserialize, Serialize};

use crate::{ControllerVariant, SensorError};

/// Converts a duration in seconds to a whole number of samples.
pub fn seconds_to_samples(seconds: f64, sample_rate_hz: f64) -> usize {
    (seconds * sample_rate_hz).round().max(0.0) as usize
}

/// Controller and rate settings for one acquisition session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default = "default_variant")]
    pub variant: ControllerVariant,
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: f64,
    #[serde(default = "default_num_streams")]
    pub num_streams: usize,
    /// Largest number of USB blocks the producer moves in one read.
    #[serde(default = "default_max_burst_blocks")]
    pub max_burst_blocks: usize,
    /// Word ring capacity, in USB blocks.
    #[serde(default = "default_word_ring_blocks")]
    pub word_ring_blocks: usize,
}

fn default_variant() -> ControllerVariant {
    ControllerVariant::Usb3Record
}
fn default_sample_rate() -> f64 {
    30_000.0
}
fn default_num_streams() -> usize {
    2
}
fn default_max_burst_blocks() -> usize {
    8
}
fn default_word_ring_blocks() -> usize {
    64
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            variant: default_variant(),
            sample_rate_hz: default_sample_rate(),
            num_streams: default_num_streams(),
            max_burst_blocks: default_max_burst_blocks(),
            word_ring_blocks: default_word_ring_blocks(),
        }
    }
}

impl AcquisitionConfig {
    pub fn frames_per_block(&self) -> usize {
        self.variant.frames_per_block()
    }

    pub fn validate(&self) -> Result<(), SensorError> {
        if self.num_streams == 0 || self.num_streams > self.variant.max_streams() {
            return Err(SensorError::UnsupportedStreamCount {
                variant: self.variant,
                requested: self.num_streams,
                max: self.variant.max_streams(),
            });
        }
        if !(self.sample_rate_hz > 0.0) {
            return Err(SensorError::ConfigurationError(format!(
                "sample rate must be positive, got {}",
                self.sample_rate_hz
            )));
        }
        if self.max_burst_blocks == 0 {
            return Err(SensorError::ConfigurationError(
                "max_burst_blocks must be at least 1".to_string(),
            ));
        }
        // One burst plus a frame of slack, so a partial block never blocks a full burst.
        if self.word_ring_blocks <= self.max_burst_blocks {
            return Err(SensorError::ConfigurationError(format!(
                "word_ring_blocks ({}) must exceed max_burst_blocks ({})",
                self.word_ring_blocks, self.max_burst_blocks
            )));
        }
        Ok(())
    }
}

/// Tabulated analog prototypes for the low/high cascades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterDesign {
    Butterworth,
    Bessel,
}

pub const MAX_FILTER_ORDER: usize = 8;

/// Notch, low-pass and high-pass settings shared by every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSettings {
    #[serde(default = "default_true")]
    pub notch_enabled: bool,
    #[serde(default = "default_notch_hz")]
    pub notch_hz: f64,
    #[serde(default = "default_notch_bandwidth")]
    pub notch_bandwidth_hz: f64,
    #[serde(default = "default_lowpass_hz")]
    pub lowpass_hz: f64,
    #[serde(default = "default_order")]
    pub lowpass_order: usize,
    #[serde(default = "default_design")]
    pub lowpass_design: FilterDesign,
    #[serde(default = "default_highpass_hz")]
    pub highpass_hz: f64,
    #[serde(default = "default_order")]
    pub highpass_order: usize,
    #[serde(default = "default_design")]
    pub highpass_design: FilterDesign,
}

fn default_true() -> bool {
    true
}
fn default_notch_hz() -> f64 {
    60.0
}
fn default_notch_bandwidth() -> f64 {
    10.0
}
fn default_lowpass_hz() -> f64 {
    300.0
}
fn default_highpass_hz() -> f64 {
    250.0
}
fn default_order() -> usize {
    2
}
fn default_design() -> FilterDesign {
    FilterDesign::Butterworth
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            notch_enabled: true,
            notch_hz: default_notch_hz(),
            notch_bandwidth_hz: default_notch_bandwidth(),
            lowpass_hz: default_lowpass_hz(),
            lowpass_order: default_order(),
            lowpass_design: default_design(),
            highpass_hz: default_highpass_hz(),
            highpass_order: default_order(),
            highpass_design: default_design(),
        }
    }
}

impl FilterSettings {
    pub fn validate(&self, sample_rate_hz: f64) -> Result<(), SensorError> {
        let nyquist = sample_rate_hz / 2.0;
        let check_cutoff = |label: &str, hz: f64| {
            if hz <= 0.0 || hz >= nyquist {
                Err(SensorError::ConfigurationError(format!(
                    "{} cutoff {} Hz must lie in (0, {}) Hz",
                    label, hz, nyquist
                )))
            } else {
                Ok(())
            }
        };
        let check_order = |label: &str, order: usize| {
            if order == 0 || order > MAX_FILTER_ORDER {
                Err(SensorError::ConfigurationError(format!(
                    "{} order {} must be 1..={}",
                    label, order, MAX_FILTER_ORDER
                )))
            } else {
                Ok(())
            }
        };
        check_cutoff("low-pass", self.lowpass_hz)?;
        check_cutoff("high-pass", self.highpass_hz)?;
        check_order("low-pass", self.lowpass_order)?;
        check_order("high-pass", self.highpass_order)?;
        if self.notch_enabled {
            check_cutoff("notch", self.notch_hz)?;
            if self.notch_bandwidth_hz <= 0.0 {
                return Err(SensorError::ConfigurationError(
                    "notch bandwidth must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Threshold detector and snippet geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorSettings {
    #[serde(default = "default_pre_ms")]
    pub pre_trigger_ms: f64,
    #[serde(default = "default_post_ms")]
    pub post_trigger_ms: f64,
    /// Initial threshold for every channel; its sign selects the crossing direction.
    #[serde(default = "default_threshold")]
    pub threshold_uv: f32,
    /// Snippets with any sample beyond this magnitude are artifacts.
    #[serde(default = "default_max_amplitude")]
    pub max_amplitude_uv: f32,
    #[serde(default)]
    pub use_hoops: bool,
}

fn default_pre_ms() -> f64 {
    0.6
}
fn default_post_ms() -> f64 {
    1.0
}
fn default_threshold() -> f32 {
    -70.0
}
fn default_max_amplitude() -> f32 {
    1000.0
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            pre_trigger_ms: default_pre_ms(),
            post_trigger_ms: default_post_ms(),
            threshold_uv: default_threshold(),
            max_amplitude_uv: default_max_amplitude(),
            use_hoops: false,
        }
    }
}

impl DetectorSettings {
    pub fn pre_samples(&self, sample_rate_hz: f64) -> usize {
        seconds_to_samples(self.pre_trigger_ms / 1000.0, sample_rate_hz)
    }

    pub fn post_samples(&self, sample_rate_hz: f64) -> usize {
        seconds_to_samples(self.post_trigger_ms / 1000.0, sample_rate_hz)
    }

    pub fn validate(&self, sample_rate_hz: f64) -> Result<(), SensorError> {
        if self.pre_samples(sample_rate_hz) == 0 || self.post_samples(sample_rate_hz) == 0 {
            return Err(SensorError::ConfigurationError(
                "pre- and post-trigger windows must each span at least one sample".to_string(),
            ));
        }
        if !(self.max_amplitude_uv > 0.0) {
            return Err(SensorError::ConfigurationError(
                "max_amplitude_uv must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sizing of the published waveform ring, in USB blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformRingConfig {
    #[serde(default = "default_capacity_blocks")]
    pub capacity_blocks: usize,
    /// History retained behind each reader for look-back.
    #[serde(default = "default_memory_blocks")]
    pub memory_blocks: usize,
    /// Samples a reader leaves unread, so its look-ahead never races the writer.
    #[serde(default = "default_one")]
    pub drain_margin_blocks: usize,
    /// Largest single write reservation.
    #[serde(default = "default_one")]
    pub max_write_blocks: usize,
}

fn default_capacity_blocks() -> usize {
    512
}
fn default_memory_blocks() -> usize {
    128
}
fn default_one() -> usize {
    1
}

impl Default for WaveformRingConfig {
    fn default() -> Self {
        Self {
            capacity_blocks: default_capacity_blocks(),
            memory_blocks: default_memory_blocks(),
            drain_margin_blocks: default_one(),
            max_write_blocks: default_one(),
        }
    }
}

impl WaveformRingConfig {
    pub fn validate(&self) -> Result<(), SensorError> {
        if self.max_write_blocks == 0 {
            return Err(SensorError::ConfigurationError(
                "max_write_blocks must be at least 1".to_string(),
            ));
        }
        if self.memory_blocks + self.max_write_blocks + self.drain_margin_blocks
            >= self.capacity_blocks
        {
            return Err(SensorError::ConfigurationError(format!(
                "capacity_blocks ({}) must exceed memory + write burst + drain margin ({})",
                self.capacity_blocks,
                self.memory_blocks + self.max_write_blocks + self.drain_margin_blocks
            )));
        }
        Ok(())
    }
}

/// Which input arms a triggered recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSource {
    Digital { line: usize },
    Analog { input: usize, threshold_volts: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolarity {
    ActiveHigh,
    ActiveLow,
}

/// Trigger-gated recording settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSettings {
    pub source: TriggerSource,
    #[serde(default = "default_polarity")]
    pub polarity: TriggerPolarity,
    #[serde(default = "default_pre_trigger")]
    pub pre_trigger_seconds: f64,
    #[serde(default = "default_post_trigger")]
    pub post_trigger_seconds: f64,
    /// Inactive stretches shorter than this do not end a recording.
    #[serde(default = "default_glitch_ignore")]
    pub glitch_ignore_seconds: f64,
    /// Round the pre-trigger start down to a USB block boundary.
    #[serde(default)]
    pub align_to_blocks: bool,
}

fn default_polarity() -> TriggerPolarity {
    TriggerPolarity::ActiveHigh
}
fn default_pre_trigger() -> f64 {
    0.1
}
fn default_post_trigger() -> f64 {
    0.5
}
fn default_glitch_ignore() -> f64 {
    0.002
}

impl TriggerSettings {
    pub fn digital(line: usize) -> Self {
        Self {
            source: TriggerSource::Digital { line },
            polarity: default_polarity(),
            pre_trigger_seconds: default_pre_trigger(),
            post_trigger_seconds: default_post_trigger(),
            glitch_ignore_seconds: default_glitch_ignore(),
            align_to_blocks: false,
        }
    }
}

/// Backend selection; `auto` benchmarks and keeps the fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendChoice {
    #[default]
    Auto,
    Cpu,
    /// CPU worker pool.
    Device,
    /// Compute shader on the first available adapter.
    Gpu,
}
