//! Backend benchmarking and selection.

use std::time::{Duration, Instant};

use neuro_sensor::{FrameCodec, FrameLayout, SignalGenerator, SyntheticConfig};
use neuro_types::BackendChoice;
use serde::Serialize;
use tracing::{info, warn};

use super::{Backend, BackendKind, BackendSetup, BlockOutput};
use crate::error::{PipelineError, PipelineResult};

/// Blocks run per backend when choosing automatically.
pub const DIAGNOSTIC_BLOCKS: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkResult {
    pub kind: BackendKind,
    pub blocks: usize,
    pub elapsed: Duration,
}

impl BenchmarkResult {
    pub fn blocks_per_second(&self) -> f64 {
        self.blocks as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }
}

/// Reproducible raw blocks of synthetic neural signal with spikes.
pub fn diagnostic_blocks(
    layout: &FrameLayout,
    count: usize,
    seed: u64,
) -> PipelineResult<Vec<Vec<u16>>> {
    let config = SyntheticConfig {
        seed,
        spike_rate_hz: 50.0,
        paced: false,
        ..SyntheticConfig::default()
    };
    let mut generator = SignalGenerator::new(*layout, 30_000.0, config)?;
    let codec = FrameCodec::new(*layout);
    let wpf = layout.words_per_frame();
    (0..count)
        .map(|_| -> PipelineResult<Vec<u16>> {
            let mut block = vec![0u16; layout.words_per_block()];
            for frame in block.chunks_exact_mut(wpf) {
                codec.encode_into(generator.next_frame(), frame)?;
            }
            Ok(block)
        })
        .collect()
}

/// Times `blocks` diagnostic blocks on every backend that can be built, fastest first.
pub fn benchmark(setup: &BackendSetup, blocks: usize) -> PipelineResult<Vec<BenchmarkResult>> {
    let inputs = diagnostic_blocks(&setup.layout, blocks, 0x5eed)?;
    let mut results = Vec::with_capacity(BackendKind::ALL.len());
    for kind in BackendKind::ALL {
        let mut backend = match Backend::new(kind, setup) {
            Ok(b) => b,
            Err(e) => {
                warn!("Skipping {} backend in benchmark: {}", kind, e);
                continue;
            }
        };
        let mut out = BlockOutput::new(setup.channels.len(), setup.layout.frames_per_block())?;
        let start = Instant::now();
        for raw in &inputs {
            backend.process_block(raw, &mut out)?;
        }
        let result = BenchmarkResult {
            kind,
            blocks,
            elapsed: start.elapsed(),
        };
        info!(
            "Benchmark {}: {} blocks in {:?} ({:.0} blocks/s)",
            kind,
            blocks,
            result.elapsed,
            result.blocks_per_second()
        );
        results.push(result);
    }
    results.sort_by_key(|r| r.elapsed);
    Ok(results)
}

/// Builds the backend named by `choice`, benchmarking first when it is `Auto`.
pub fn select_backend(choice: BackendChoice, setup: &BackendSetup) -> PipelineResult<Backend> {
    let kind = match choice {
        BackendChoice::Cpu => BackendKind::Cpu,
        BackendChoice::Device => BackendKind::Device,
        BackendChoice::Gpu => BackendKind::Gpu,
        BackendChoice::Auto => {
            let ranked = benchmark(setup, DIAGNOSTIC_BLOCKS)?;
            let fastest = ranked.first().ok_or_else(|| {
                PipelineError::invalid_configuration("no processing backend could be built")
            })?;
            info!("Selected fastest backend: {}", fastest.kind);
            fastest.kind
        }
    };
    Backend::new(kind, setup)
}
