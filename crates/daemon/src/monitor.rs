//! Live spike-rate readout, attached to the waveform ring as its own reader.

use neuro_types::WaveformKind;
use pipeline::{PipelineResult, ReaderSink, WaveformId, WaveformReader};
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRate {
    pub channel: String,
    pub spikes: u64,
    pub rate_hz: f64,
}

/// Counts spikes on every channel's spike view and logs the busiest channels once per
/// reporting window of samples.
pub struct SpikeMonitor {
    sample_rate_hz: f64,
    window: usize,
    top: usize,
    channels: Vec<(String, WaveformId)>,
    counts: Vec<u64>,
    seen: usize,
}

impl SpikeMonitor {
    pub fn new(sample_rate_hz: f64, window_seconds: f64, top: usize) -> Self {
        Self {
            sample_rate_hz,
            window: ((window_seconds * sample_rate_hz) as usize).max(1),
            top,
            channels: Vec::new(),
            counts: Vec::new(),
            seen: 0,
        }
    }

    /// Busiest channels of the current window, most active first.
    pub fn busiest(&self) -> Vec<ChannelRate> {
        let seconds = self.seen.max(1) as f64 / self.sample_rate_hz;
        let mut rates: Vec<ChannelRate> = self
            .channels
            .iter()
            .zip(&self.counts)
            .filter(|(_, &n)| n > 0)
            .map(|((channel, _), &spikes)| ChannelRate {
                channel: channel.clone(),
                spikes,
                rate_hz: spikes as f64 / seconds,
            })
            .collect();
        rates.sort_by(|a, b| b.spikes.cmp(&a.spikes).then_with(|| a.channel.cmp(&b.channel)));
        rates.truncate(self.top);
        rates
    }

    fn report(&mut self) {
        let total: u64 = self.counts.iter().sum();
        let busiest = self
            .busiest()
            .iter()
            .map(|r| format!("{} {:.1} Hz", r.channel, r.rate_hz))
            .collect::<Vec<_>>()
            .join(", ");
        info!(
            "{} spikes in {:.1} s across {} channels; busiest: [{}]",
            total,
            self.seen as f64 / self.sample_rate_hz,
            self.channels.len(),
            busiest
        );
        self.counts.iter_mut().for_each(|c| *c = 0);
        self.seen = 0;
    }
}

impl ReaderSink for SpikeMonitor {
    fn start(&mut self, reader: &WaveformReader) -> PipelineResult<()> {
        let catalog = reader.catalog();
        let suffix = format!("|{}", WaveformKind::Spike.suffix());
        self.channels = catalog
            .names()
            .filter_map(|name| {
                let channel = name.strip_suffix(&suffix)?;
                Some((channel.to_string(), catalog.id(name).ok()?))
            })
            .collect();
        self.counts = vec![0; self.channels.len()];
        Ok(())
    }

    fn consume(&mut self, reader: &WaveformReader, n: usize) -> PipelineResult<()> {
        for (count, (_, id)) in self.counts.iter_mut().zip(&self.channels) {
            for t in 0..n as isize {
                if reader.spike_class(*id, t)?.is_spike() {
                    *count += 1;
                }
            }
        }
        self.seen += n;
        if self.seen >= self.window {
            self.report();
        }
        Ok(())
    }
}
