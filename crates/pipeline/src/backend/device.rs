//! Data-parallel CPU backend.
//!
//! Each channel is an independent lane with its own copy of the filter and detector
//! state and its own output buffers. Before a block the host state is copied into the
//! lanes, every lane runs on a dedicated rayon pool, and the outputs and updated state
//! are copied back in channel order. Host state stays authoritative between blocks, so
//! switching away never loses history.

use neuro_sensor::FrameCodec;
use neuro_types::SpikeEvent;
use rayon::prelude::*;
use tracing::debug;

use super::kernel::{run_channel, ChannelBank, ChannelOut, ChannelState};
use super::BlockOutput;
use crate::allocator;
use crate::error::{BackendError, PipelineResult};

struct Lane {
    state: ChannelState,
    scratch: Vec<f32>,
    wide: Vec<u16>,
    low: Vec<u16>,
    high: Vec<u16>,
    ids: Vec<u8>,
    events: Vec<SpikeEvent>,
}

impl Lane {
    fn new(state: &ChannelState, frames: usize) -> PipelineResult<Self> {
        Ok(Self {
            state: state.clone(),
            scratch: allocator::filled(frames, 0.0, "device lane scratch")?,
            wide: allocator::filled(frames, 0, "device lane wideband")?,
            low: allocator::filled(frames, 0, "device lane low-pass")?,
            high: allocator::filled(frames, 0, "device lane high-pass")?,
            ids: allocator::filled(frames, 0, "device lane spike ids")?,
            events: Vec::new(),
        })
    }
}

pub struct DeviceBackend {
    pool: rayon::ThreadPool,
    bank: ChannelBank,
    codec: FrameCodec,
    lanes: Vec<Lane>,
    staging: Vec<u16>,
}

impl DeviceBackend {
    pub fn new(bank: ChannelBank, codec: FrameCodec, threads: usize) -> PipelineResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("device-lane-{}", i))
            .build()
            .map_err(|e| BackendError::Unavailable {
                backend: "device",
                reason: format!("failed to create worker pool: {}", e),
            })?;
        let lanes = bank
            .states
            .iter()
            .map(|state| Lane::new(state, bank.frames))
            .collect::<PipelineResult<Vec<_>>>()?;
        let staging = allocator::filled(bank.words_per_block(), 0, "device staging")?;
        debug!(
            "Device backend: {} lanes on {} workers",
            lanes.len(),
            threads.max(1)
        );
        Ok(Self {
            pool,
            bank,
            codec,
            lanes,
            staging,
        })
    }

    pub fn bank(&self) -> &ChannelBank {
        &self.bank
    }

    pub fn bank_mut(&mut self) -> &mut ChannelBank {
        &mut self.bank
    }

    fn upload(&mut self, raw: &[u16]) {
        self.staging.copy_from_slice(raw);
        for (lane, state) in self.lanes.iter_mut().zip(&self.bank.states) {
            lane.state.clone_from(state);
        }
    }

    fn download(&mut self, out: &mut BlockOutput) {
        let frames = self.bank.frames;
        for (i, (lane, state)) in self.lanes.iter_mut().zip(&mut self.bank.states).enumerate() {
            state.clone_from(&lane.state);
            let span = i * frames..(i + 1) * frames;
            out.wide[span.clone()].copy_from_slice(&lane.wide);
            out.low[span.clone()].copy_from_slice(&lane.low);
            out.high[span.clone()].copy_from_slice(&lane.high);
            out.spike_ids[span].copy_from_slice(&lane.ids);
            out.spikes.append(&mut lane.events);
        }
    }

    pub fn process_block(&mut self, raw: &[u16], out: &mut BlockOutput) -> PipelineResult<()> {
        self.bank.check_block(raw)?;
        let base_timestamp = self.codec.timestamp(raw)?;
        out.prepare(self.bank.len(), self.bank.frames, base_timestamp);

        self.upload(raw);
        let words_per_frame = self.bank.words_per_frame;
        let staging = &self.staging;
        let lanes = &mut self.lanes;
        self.pool.install(|| {
            lanes.par_iter_mut().try_for_each(|lane| {
                lane.events.clear();
                run_channel(
                    &mut lane.state,
                    staging,
                    words_per_frame,
                    base_timestamp,
                    &mut lane.scratch,
                    ChannelOut {
                        wide: &mut lane.wide,
                        low: &mut lane.low,
                        high: &mut lane.high,
                        ids: &mut lane.ids,
                        events: &mut lane.events,
                    },
                )
            })
        })?;
        self.download(out);
        Ok(())
    }
}
