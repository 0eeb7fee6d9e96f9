//! Per-channel block transform shared by every backend.

use neuro_sensor::units;
use neuro_types::{HoopDefinition, SpikeEvent, StreamChannelAddress};
use tracing::error;

use super::BackendSetup;
use crate::dsp::{ChannelFilters, FilterPlan};
use crate::error::{BackendError, PipelineResult};
use crate::spike::SpikeDetector;

/// Persistent filter and detector state for one amplifier channel.
pub struct ChannelState {
    pub address: StreamChannelAddress,
    /// Word offset of this channel's amplifier sample within a frame.
    pub amp_offset: usize,
    pub filters: ChannelFilters,
    pub detector: SpikeDetector,
}

impl Clone for ChannelState {
    fn clone(&self) -> Self {
        Self {
            address: self.address,
            amp_offset: self.amp_offset,
            filters: self.filters,
            detector: self.detector.clone(),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        self.address = source.address;
        self.amp_offset = source.amp_offset;
        self.filters = source.filters;
        self.detector.clone_from(&source.detector);
    }
}

/// Output slices for one channel of one block.
pub(crate) struct ChannelOut<'a> {
    pub wide: &'a mut [u16],
    pub low: &'a mut [u16],
    pub high: &'a mut [u16],
    pub ids: &'a mut [u8],
    pub events: &'a mut Vec<SpikeEvent>,
}

/// Filters one channel through a block of raw frames and detects spikes on the
/// high-pass output. `scratch` holds at least one block of samples.
pub(crate) fn run_channel(
    state: &mut ChannelState,
    raw: &[u16],
    words_per_frame: usize,
    base_timestamp: u32,
    scratch: &mut [f32],
    out: ChannelOut<'_>,
) -> PipelineResult<()> {
    let frames = out.wide.len();
    for f in 0..frames {
        let code = raw[f * words_per_frame + state.amp_offset];
        let y = state.filters.run(units::amplifier_microvolts(code));
        out.wide[f] = units::microvolts_to_amplifier_code(y.wide);
        out.low[f] = units::microvolts_to_amplifier_code(y.low);
        out.high[f] = units::microvolts_to_amplifier_code(y.high);
        scratch[f] = y.high;
    }
    detect_channel(state, &scratch[..frames], base_timestamp, out.ids, out.events)
}

/// Runs the detector over one block of high-pass microvolts, marking `ids` and
/// appending events.
pub(crate) fn detect_channel(
    state: &mut ChannelState,
    high: &[f32],
    base_timestamp: u32,
    ids: &mut [u8],
    events: &mut Vec<SpikeEvent>,
) -> PipelineResult<()> {
    ids.fill(0);
    let channel = state.address;
    state.detector.detect(high, |d| {
        let index = d.offset.max(0) as usize;
        ids[index] = d.class.code();
        events.push(SpikeEvent {
            timestamp: base_timestamp.wrapping_add_signed(d.offset as i32),
            channel,
            class: d.class,
        });
    })
}

/// Every channel's state plus the block geometry. Moves between backends on a switch.
#[derive(Clone)]
pub struct ChannelBank {
    pub(crate) states: Vec<ChannelState>,
    pub(crate) words_per_frame: usize,
    pub(crate) frames: usize,
}

impl ChannelBank {
    pub fn new(setup: &BackendSetup) -> PipelineResult<Self> {
        let plan = FilterPlan::new(&setup.filters, setup.sample_rate_hz)?;
        let frames = setup.layout.frames_per_block();
        let pre = setup.detector.pre_samples(setup.sample_rate_hz);
        let post = setup.detector.post_samples(setup.sample_rate_hz);
        let states = setup
            .channels
            .iter()
            .map(|&address| ChannelState {
                address,
                amp_offset: setup
                    .layout
                    .amplifier_offset(address.channel as usize, address.stream as usize),
                filters: ChannelFilters::new(&plan),
                detector: SpikeDetector::new(
                    pre,
                    post,
                    frames,
                    setup.detector.threshold_uv,
                    setup.detector.max_amplitude_uv,
                ),
            })
            .collect();
        Ok(Self {
            states,
            words_per_frame: setup.layout.words_per_frame(),
            frames,
        })
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn words_per_block(&self) -> usize {
        self.frames * self.words_per_frame
    }

    pub fn states(&self) -> &[ChannelState] {
        &self.states
    }

    fn channel(&mut self, index: usize) -> Result<&mut ChannelState, BackendError> {
        let count = self.states.len();
        self.states.get_mut(index).ok_or_else(|| {
            error!("Channel index {} out of range ({} channels)", index, count);
            BackendError::ChannelOutOfRange { index, count }
        })
    }

    pub fn set_threshold(&mut self, index: usize, threshold_uv: f32) -> PipelineResult<()> {
        self.channel(index)?.detector.set_threshold(threshold_uv);
        Ok(())
    }

    pub fn set_use_hoops(&mut self, index: usize, enabled: bool) -> PipelineResult<()> {
        self.channel(index)?.detector.set_use_hoops(enabled);
        Ok(())
    }

    pub fn set_hoop(
        &mut self,
        index: usize,
        unit: usize,
        hoop: usize,
        definition: HoopDefinition,
    ) -> PipelineResult<()> {
        self.channel(index)?.detector.set_hoop(unit, hoop, definition)
    }

    /// Rebuilds for a new setup. Thresholds and hoops carry over for channels present in
    /// both; filter and detector history restart.
    pub fn reconfigure(&mut self, setup: &BackendSetup) -> PipelineResult<()> {
        let mut next = ChannelBank::new(setup)?;
        for state in &mut next.states {
            if let Some(old) = self.states.iter().find(|s| s.address == state.address) {
                state.detector.copy_settings_from(&old.detector);
            }
        }
        *self = next;
        Ok(())
    }

    pub(crate) fn check_block(&self, raw: &[u16]) -> Result<(), BackendError> {
        let expected = self.words_per_block();
        if raw.len() != expected {
            return Err(BackendError::BlockSize {
                expected,
                got: raw.len(),
            });
        }
        Ok(())
    }
}
