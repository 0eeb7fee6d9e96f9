//! Shared counters the pipeline threads update and the daemon reports.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub words_produced: CachePadded<AtomicU64>,
    pub overruns: CachePadded<AtomicU64>,
    pub framing_errors: CachePadded<AtomicU64>,
    pub words_dropped: CachePadded<AtomicU64>,
    pub blocks_processed: CachePadded<AtomicU64>,
    pub spikes_detected: CachePadded<AtomicU64>,
    pub backpressure_events: CachePadded<AtomicU64>,
    transformer_load: AtomicU32,
    ring_fill: AtomicU32,
}

impl PipelineStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Fraction of wall time the transformer spent processing, in percent.
    pub fn set_transformer_load(&self, percent: f32) {
        self.transformer_load.store(percent.to_bits(), Ordering::Relaxed);
    }

    pub fn set_ring_fill(&self, percent: f32) {
        self.ring_fill.store(percent.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        fn get(c: &AtomicU64) -> u64 {
            c.load(Ordering::Relaxed)
        }
        StatsSnapshot {
            words_produced: get(&self.words_produced),
            overruns: get(&self.overruns),
            framing_errors: get(&self.framing_errors),
            words_dropped: get(&self.words_dropped),
            blocks_processed: get(&self.blocks_processed),
            spikes_detected: get(&self.spikes_detected),
            backpressure_events: get(&self.backpressure_events),
            transformer_load_percent: f32::from_bits(self.transformer_load.load(Ordering::Relaxed)),
            ring_fill_percent: f32::from_bits(self.ring_fill.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub words_produced: u64,
    pub overruns: u64,
    pub framing_errors: u64,
    pub words_dropped: u64,
    pub blocks_processed: u64,
    pub spikes_detected: u64,
    pub backpressure_events: u64,
    pub transformer_load_percent: f32,
    pub ring_fill_percent: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_counters_and_gauges() {
        let stats = PipelineStats::default();
        PipelineStats::add(&stats.overruns, 2);
        PipelineStats::add(&stats.blocks_processed, 5);
        stats.set_transformer_load(37.5);
        let snap = stats.snapshot();
        assert_eq!(snap.overruns, 2);
        assert_eq!(snap.blocks_processed, 5);
        assert_eq!(snap.transformer_load_percent, 37.5);
        assert_eq!(snap.ring_fill_percent, 0.0);
    }
}
