//! Block processing backends.
//!
//! A backend turns one block of raw frames into wideband, low-pass and high-pass codes
//! per channel plus spike events. The CPU and worker-pool backends run the same
//! per-channel kernel, so their outputs are bit-identical. The GPU backend runs the
//! filters in a compute shader and matches them to within one code. The choice is a
//! runtime value and can change between blocks without losing filter or detector state.

pub mod bench;
pub mod cpu;
pub mod device;
pub mod gpu;
pub mod kernel;

use std::fmt;

use neuro_sensor::{FrameCodec, FrameLayout};
use neuro_types::{
    DetectorSettings, FilterSettings, HoopDefinition, SensorError, SessionContext, SpikeEvent,
    StreamChannelAddress,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::allocator;
use crate::error::PipelineResult;

pub use bench::{benchmark, diagnostic_blocks, select_backend, BenchmarkResult};
pub use cpu::CpuBackend;
pub use device::DeviceBackend;
pub use gpu::GpuBackend;
pub use kernel::{ChannelBank, ChannelState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Cpu,
    /// CPU worker pool.
    Device,
    Gpu,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Cpu, BackendKind::Device, BackendKind::Gpu];

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Cpu => "cpu",
            BackendKind::Device => "device",
            BackendKind::Gpu => "gpu",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a backend needs to size its buffers and build channel state.
#[derive(Debug, Clone)]
pub struct BackendSetup {
    pub layout: FrameLayout,
    pub sample_rate_hz: f64,
    /// Sorted by address.
    pub channels: Vec<StreamChannelAddress>,
    pub filters: FilterSettings,
    pub detector: DetectorSettings,
    pub device_threads: usize,
}

impl BackendSetup {
    pub fn from_session(session: &SessionContext) -> PipelineResult<Self> {
        let acq = &session.acquisition;
        Ok(Self {
            layout: FrameLayout::new(acq.variant, acq.num_streams)?,
            sample_rate_hz: acq.sample_rate_hz,
            channels: session.channels.iter().map(|c| c.address).collect(),
            filters: session.filters.clone(),
            detector: session.detector.clone(),
            device_threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
        })
    }

    pub fn channel_index(&self, address: StreamChannelAddress) -> Result<usize, SensorError> {
        self.channels
            .binary_search(&address)
            .map_err(|_| SensorError::UnknownChannel(address))
    }
}

/// Results for one block, channel-major: channel `c` occupies `[c * frames, (c + 1) * frames)`.
#[derive(Debug, Clone, Default)]
pub struct BlockOutput {
    pub channels: usize,
    pub frames: usize,
    pub base_timestamp: u32,
    pub wide: Vec<u16>,
    pub low: Vec<u16>,
    pub high: Vec<u16>,
    pub spike_ids: Vec<u8>,
    pub spikes: Vec<SpikeEvent>,
}

impl BlockOutput {
    pub fn new(channels: usize, frames: usize) -> PipelineResult<Self> {
        let len = channels * frames;
        Ok(Self {
            channels,
            frames,
            base_timestamp: 0,
            wide: allocator::filled(len, 0, "wideband output")?,
            low: allocator::filled(len, 0, "low-pass output")?,
            high: allocator::filled(len, 0, "high-pass output")?,
            spike_ids: allocator::filled(len, 0, "spike id output")?,
            spikes: Vec::new(),
        })
    }

    fn prepare(&mut self, channels: usize, frames: usize, base_timestamp: u32) {
        if self.channels != channels || self.frames != frames {
            let len = channels * frames;
            self.wide.resize(len, 0);
            self.low.resize(len, 0);
            self.high.resize(len, 0);
            self.spike_ids.resize(len, 0);
            self.channels = channels;
            self.frames = frames;
        }
        self.base_timestamp = base_timestamp;
        self.spikes.clear();
    }

    fn span(&self, channel: usize) -> std::ops::Range<usize> {
        channel * self.frames..(channel + 1) * self.frames
    }

    pub fn wide(&self, channel: usize) -> &[u16] {
        &self.wide[self.span(channel)]
    }

    pub fn low(&self, channel: usize) -> &[u16] {
        &self.low[self.span(channel)]
    }

    pub fn high(&self, channel: usize) -> &[u16] {
        &self.high[self.span(channel)]
    }

    pub fn spike_ids(&self, channel: usize) -> &[u8] {
        &self.spike_ids[self.span(channel)]
    }
}

/// Changes applied by the transformer between blocks.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    SwitchBackend(BackendKind),
    UpdateFilters(FilterSettings),
    UpdateDetector(DetectorSettings),
    SetThreshold {
        channel: StreamChannelAddress,
        threshold_uv: f32,
    },
    SetUseHoops {
        channel: StreamChannelAddress,
        enabled: bool,
    },
    SetHoop {
        channel: StreamChannelAddress,
        unit: usize,
        hoop: usize,
        definition: HoopDefinition,
    },
}

pub enum Backend {
    Cpu(CpuBackend),
    Device(DeviceBackend),
    Gpu(GpuBackend),
}

impl Backend {
    pub fn new(kind: BackendKind, setup: &BackendSetup) -> PipelineResult<Self> {
        Self::with_bank(kind, ChannelBank::new(setup)?, setup)
    }

    fn with_bank(kind: BackendKind, bank: ChannelBank, setup: &BackendSetup) -> PipelineResult<Self> {
        let codec = FrameCodec::new(setup.layout);
        Ok(match kind {
            BackendKind::Cpu => Backend::Cpu(CpuBackend::new(bank, codec)?),
            BackendKind::Device => {
                Backend::Device(DeviceBackend::new(bank, codec, setup.device_threads)?)
            }
            BackendKind::Gpu => Backend::Gpu(GpuBackend::new(bank, codec)?),
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Cpu(_) => BackendKind::Cpu,
            Backend::Device(_) => BackendKind::Device,
            Backend::Gpu(_) => BackendKind::Gpu,
        }
    }

    pub fn bank(&self) -> &ChannelBank {
        match self {
            Backend::Cpu(b) => b.bank(),
            Backend::Device(b) => b.bank(),
            Backend::Gpu(b) => b.bank(),
        }
    }

    fn bank_mut(&mut self) -> &mut ChannelBank {
        match self {
            Backend::Cpu(b) => b.bank_mut(),
            Backend::Device(b) => b.bank_mut(),
            Backend::Gpu(b) => b.bank_mut(),
        }
    }

    /// Processes one block of `frames_per_block` raw frames.
    pub fn process_block(&mut self, raw: &[u16], out: &mut BlockOutput) -> PipelineResult<()> {
        match self {
            Backend::Cpu(b) => b.process_block(raw, out),
            Backend::Device(b) => b.process_block(raw, out),
            Backend::Gpu(b) => b.process_block(raw, out),
        }
    }

    /// Moves channel state to a backend of `kind`. On failure the current backend stays.
    pub fn switch_to(&mut self, kind: BackendKind, setup: &BackendSetup) -> PipelineResult<()> {
        if kind == self.kind() {
            return Ok(());
        }
        let next = Self::with_bank(kind, self.bank().clone(), setup)?;
        info!("Switched processing backend {} -> {}", self.kind(), kind);
        *self = next;
        Ok(())
    }

    /// Reallocates for a new setup, keeping per-channel thresholds and hoops.
    pub fn reconfigure(&mut self, setup: &BackendSetup) -> PipelineResult<()> {
        let mut bank = self.bank().clone();
        bank.reconfigure(setup)?;
        *self = Self::with_bank(self.kind(), bank, setup)?;
        Ok(())
    }

    pub fn apply(&mut self, command: &EngineCommand, setup: &mut BackendSetup) -> PipelineResult<()> {
        match command {
            EngineCommand::SwitchBackend(kind) => self.switch_to(*kind, setup),
            EngineCommand::UpdateFilters(filters) => {
                filters.validate(setup.sample_rate_hz)?;
                let next = BackendSetup {
                    filters: filters.clone(),
                    ..setup.clone()
                };
                self.reconfigure(&next)?;
                *setup = next;
                Ok(())
            }
            EngineCommand::UpdateDetector(detector) => {
                detector.validate(setup.sample_rate_hz)?;
                let next = BackendSetup {
                    detector: detector.clone(),
                    ..setup.clone()
                };
                self.reconfigure(&next)?;
                *setup = next;
                Ok(())
            }
            EngineCommand::SetThreshold {
                channel,
                threshold_uv,
            } => {
                let index = setup.channel_index(*channel)?;
                self.bank_mut().set_threshold(index, *threshold_uv)
            }
            EngineCommand::SetUseHoops { channel, enabled } => {
                let index = setup.channel_index(*channel)?;
                self.bank_mut().set_use_hoops(index, *enabled)
            }
            EngineCommand::SetHoop {
                channel,
                unit,
                hoop,
                definition,
            } => {
                let index = setup.channel_index(*channel)?;
                self.bank_mut().set_hoop(index, *unit, *hoop, *definition)
            }
        }
    }
}
