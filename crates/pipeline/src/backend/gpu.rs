//! Compute-shader backend.
//!
//! Every block uploads the packed raw words and each channel's filter history, runs one
//! shader invocation per channel through the notch and both cascades, and downloads the
//! three requantized waveforms, the high-pass microvolts and the updated history. Spike
//! detection then runs on the host over the downloaded high-pass samples. The host keeps
//! the authoritative channel state between blocks, so a switch in either direction
//! carries filter and detector history unchanged.

use std::fmt::Display;

use neuro_sensor::FrameCodec;
use tracing::{debug, info};
use wgpu::util::DeviceExt;

use super::kernel::{detect_channel, ChannelBank};
use super::BlockOutput;
use crate::allocator;
use crate::dsp::{CHANNEL_SECTIONS, MAX_SECTIONS, SECTION_COEFFICIENTS, SECTION_HISTORY};
use crate::error::{BackendError, PipelineResult};

/// The shader hardcodes this slot layout.
const _: () = assert!(CHANNEL_SECTIONS == 9 && MAX_SECTIONS == 4);

const WORKGROUP_SIZE: usize = 64;
/// Codes per frame and channel: wideband, low-pass, high-pass.
const CODES: usize = 3;

fn unavailable(reason: impl Display) -> BackendError {
    BackendError::Unavailable {
        backend: "gpu",
        reason: reason.to_string(),
    }
}

fn failed(reason: impl Display) -> BackendError {
    BackendError::Execution {
        backend: "gpu",
        reason: reason.to_string(),
    }
}

fn byte_len<T>(items: &[T]) -> u64 {
    std::mem::size_of_val(items) as u64
}

/// Device objects plus the buffers for one block geometry.
struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    raw: wgpu::Buffer,
    history: wgpu::Buffer,
    codes: wgpu::Buffer,
    high: wgpu::Buffer,
    readback: wgpu::Buffer,
    workgroups: u32,
}

/// Host-side mirrors of the device buffers.
struct Staging {
    raw: Vec<u32>,
    history: Vec<f32>,
    codes: Vec<u32>,
    high: Vec<f32>,
}

impl GpuContext {
    async fn new(bank: &ChannelBank, staging: &Staging) -> Result<Self, BackendError> {
        let channels = bank.len();
        let first = bank
            .states()
            .first()
            .ok_or_else(|| unavailable("no channels to process"))?;
        let filters = &first.filters;

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(unavailable)?;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("channel filter device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await
            .map_err(unavailable)?;
        info!("GPU backend on adapter '{}'", adapter.get_info().name);

        let params: [u32; 8] = [
            bank.frames() as u32,
            bank.words_per_frame as u32,
            channels as u32,
            filters.lowpass_len() as u32,
            filters.highpass_len() as u32,
            u32::from(filters.has_notch()),
            0,
            0,
        ];
        let mut coefficients = [0.0f32; CHANNEL_SECTIONS * SECTION_COEFFICIENTS];
        filters.export_coefficients(&mut coefficients);
        let offsets: Vec<u32> = bank.states().iter().map(|s| s.amp_offset as u32).collect();

        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("filter params"),
            contents: bytemuck::cast_slice(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let coefficients = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("filter coefficients"),
            contents: bytemuck::cast_slice(&coefficients),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let offsets = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("amplifier offsets"),
            contents: bytemuck::cast_slice(&offsets),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let buffer = |label: &str, size: u64, usage: wgpu::BufferUsages| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        };
        let upload = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
        let output = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC;
        let raw = buffer("raw block", byte_len(&staging.raw), upload);
        let history = buffer(
            "filter history",
            byte_len(&staging.history),
            upload | wgpu::BufferUsages::COPY_SRC,
        );
        let codes = buffer("filtered codes", byte_len(&staging.codes), output);
        let high = buffer("high-pass microvolts", byte_len(&staging.high), output);
        let readback = buffer(
            "block readback",
            byte_len(&staging.history) + byte_len(&staging.codes) + byte_len(&staging.high),
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        );

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("channel filters"),
            source: wgpu::ShaderSource::Wgsl(include_str!("filter.wgsl").into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("channel filters"),
            layout: None,
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });
        let layout = pipeline.get_bind_group_layout(0);
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("channel filters"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: raw.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: coefficients.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: offsets.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: history.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: codes.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: high.as_entire_binding(),
                },
            ],
        });

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group,
            raw,
            history,
            codes,
            high,
            readback,
            workgroups: channels.div_ceil(WORKGROUP_SIZE) as u32,
        })
    }

    /// Uploads the block and history, filters, and downloads into `staging`.
    fn run(&self, staging: &mut Staging) -> Result<(), BackendError> {
        self.queue
            .write_buffer(&self.raw, 0, bytemuck::cast_slice(&staging.raw));
        self.queue
            .write_buffer(&self.history, 0, bytemuck::cast_slice(&staging.history));

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("filter block"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("filter block"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.dispatch_workgroups(self.workgroups, 1, 1);
        }
        let history = byte_len(&staging.history);
        let codes = byte_len(&staging.codes);
        let high = byte_len(&staging.high);
        encoder.copy_buffer_to_buffer(&self.history, 0, &self.readback, 0, history);
        encoder.copy_buffer_to_buffer(&self.codes, 0, &self.readback, history, codes);
        encoder.copy_buffer_to_buffer(&self.high, 0, &self.readback, history + codes, high);
        self.queue.submit(Some(encoder.finish()));

        let slice = self.readback.slice(..);
        let (tx, rx) = flume::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            // The receiver only goes away if this call already returned with an error.
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::PollType::Wait).map_err(failed)?;
        rx.recv().map_err(failed)?.map_err(failed)?;
        {
            let view = slice.get_mapped_range();
            let (history_bytes, rest) = view.split_at(history as usize);
            let (code_bytes, high_bytes) = rest.split_at(codes as usize);
            staging
                .history
                .copy_from_slice(bytemuck::try_cast_slice(history_bytes).map_err(failed)?);
            staging
                .codes
                .copy_from_slice(bytemuck::try_cast_slice(code_bytes).map_err(failed)?);
            staging
                .high
                .copy_from_slice(bytemuck::try_cast_slice(high_bytes).map_err(failed)?);
        }
        self.readback.unmap();
        Ok(())
    }
}

pub struct GpuBackend {
    bank: ChannelBank,
    codec: FrameCodec,
    context: GpuContext,
    staging: Staging,
}

impl GpuBackend {
    /// Fails with [`BackendError::Unavailable`] when no adapter or device can be opened.
    pub fn new(bank: ChannelBank, codec: FrameCodec) -> PipelineResult<Self> {
        let channels = bank.len();
        let frames = bank.frames();
        let staging = Staging {
            raw: allocator::filled(bank.words_per_block().div_ceil(2).max(1), 0, "gpu raw staging")?,
            history: allocator::filled(
                (channels * CHANNEL_SECTIONS * SECTION_HISTORY).max(1),
                0.0,
                "gpu history staging",
            )?,
            codes: allocator::filled((channels * frames * CODES).max(1), 0, "gpu code staging")?,
            high: allocator::filled((channels * frames).max(1), 0.0, "gpu high-pass staging")?,
        };
        let context = pollster::block_on(GpuContext::new(&bank, &staging))?;
        debug!(
            "GPU backend: {} channels in {} workgroups",
            channels, context.workgroups
        );
        Ok(Self {
            bank,
            codec,
            context,
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
        for (dst, pair) in self.staging.raw.iter_mut().zip(raw.chunks(2)) {
            let high = pair.get(1).copied().unwrap_or(0);
            *dst = u32::from(pair[0]) | u32::from(high) << 16;
        }
        let stride = CHANNEL_SECTIONS * SECTION_HISTORY;
        for (state, dst) in self
            .bank
            .states
            .iter()
            .zip(self.staging.history.chunks_exact_mut(stride))
        {
            state.filters.export_history(dst);
        }
    }

    fn download(&mut self, out: &mut BlockOutput, base_timestamp: u32) -> PipelineResult<()> {
        let frames = self.bank.frames;
        let stride = CHANNEL_SECTIONS * SECTION_HISTORY;
        let staging = &self.staging;
        for (c, state) in self.bank.states.iter_mut().enumerate() {
            state
                .filters
                .import_history(&staging.history[c * stride..(c + 1) * stride]);
            let span = c * frames..(c + 1) * frames;
            let codes = &staging.codes[span.start * CODES..span.end * CODES];
            for (f, code) in codes.chunks_exact(CODES).enumerate() {
                let at = span.start + f;
                out.wide[at] = code[0] as u16;
                out.low[at] = code[1] as u16;
                out.high[at] = code[2] as u16;
            }
            detect_channel(
                state,
                &staging.high[span.clone()],
                base_timestamp,
                &mut out.spike_ids[span],
                &mut out.spikes,
            )?;
        }
        Ok(())
    }

    pub fn process_block(&mut self, raw: &[u16], out: &mut BlockOutput) -> PipelineResult<()> {
        self.bank.check_block(raw)?;
        let base_timestamp = self.codec.timestamp(raw)?;
        out.prepare(self.bank.len(), self.bank.frames, base_timestamp);

        self.upload(raw);
        self.context.run(&mut self.staging)?;
        self.download(out, base_timestamp)
    }
}
