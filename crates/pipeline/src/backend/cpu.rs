use neuro_sensor::FrameCodec;

use super::kernel::{run_channel, ChannelBank, ChannelOut};
use super::BlockOutput;
use crate::allocator;
use crate::error::PipelineResult;

/// Runs every channel in turn on the calling thread.
pub struct CpuBackend {
    bank: ChannelBank,
    codec: FrameCodec,
    scratch: Vec<f32>,
}

impl CpuBackend {
    pub fn new(bank: ChannelBank, codec: FrameCodec) -> PipelineResult<Self> {
        let scratch = allocator::filled(bank.frames(), 0.0, "cpu backend scratch")?;
        Ok(Self {
            bank,
            codec,
            scratch,
        })
    }

    pub fn bank(&self) -> &ChannelBank {
        &self.bank
    }

    pub fn bank_mut(&mut self) -> &mut ChannelBank {
        &mut self.bank
    }

    pub fn process_block(&mut self, raw: &[u16], out: &mut BlockOutput) -> PipelineResult<()> {
        self.bank.check_block(raw)?;
        let frames = self.bank.frames;
        let words_per_frame = self.bank.words_per_frame;
        let base_timestamp = self.codec.timestamp(raw)?;
        out.prepare(self.bank.len(), frames, base_timestamp);

        for (i, state) in self.bank.states.iter_mut().enumerate() {
            let span = i * frames..(i + 1) * frames;
            run_channel(
                state,
                raw,
                words_per_frame,
                base_timestamp,
                &mut self.scratch,
                ChannelOut {
                    wide: &mut out.wide[span.clone()],
                    low: &mut out.low[span.clone()],
                    high: &mut out.high[span.clone()],
                    ids: &mut out.spike_ids[span],
                    events: &mut out.spikes,
                },
            )?;
        }
        Ok(())
    }
}
