//! Immutable per-session context shared by every pipeline thread.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    AcquisitionConfig, ChannelInfo, DetectorSettings, FilterSettings, SensorError,
    SignalSources, StreamChannelAddress, WaveformRingConfig,
};

/// Everything the threads of one acquisition run agree on.
///
/// Built once when acquisition starts and shared behind an `Arc`; changing the
/// stream count or channel list means building a new context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub acquisition: AcquisitionConfig,
    pub filters: FilterSettings,
    pub detector: DetectorSettings,
    pub ring: WaveformRingConfig,
    pub channels: Vec<ChannelInfo>,
}

impl SessionContext {
    pub fn new(
        acquisition: AcquisitionConfig,
        filters: FilterSettings,
        detector: DetectorSettings,
        ring: WaveformRingConfig,
        sources: &dyn SignalSources,
    ) -> Result<Arc<Self>, SensorError> {
        acquisition.validate()?;
        filters.validate(acquisition.sample_rate_hz)?;
        detector.validate(acquisition.sample_rate_hz)?;
        ring.validate()?;

        let mut channels = sources.amplifier_channels();
        channels.sort_by_key(|c| c.address);
        for ch in &channels {
            if ch.address.stream as usize >= acquisition.num_streams
                || ch.address.channel as usize >= acquisition.variant.channels_per_stream()
            {
                return Err(SensorError::UnknownChannel(ch.address));
            }
        }
        if channels.windows(2).any(|w| w[0].address == w[1].address) {
            return Err(SensorError::ConfigurationError(
                "duplicate amplifier channel in signal sources".to_string(),
            ));
        }

        Ok(Arc::new(Self {
            acquisition,
            filters,
            detector,
            ring,
            channels,
        }))
    }

    pub fn sample_rate_hz(&self) -> f64 {
        self.acquisition.sample_rate_hz
    }

    pub fn frames_per_block(&self) -> usize {
        self.acquisition.frames_per_block()
    }

    pub fn channel_index(&self, address: StreamChannelAddress) -> Option<usize> {
        self.channels
            .binary_search_by_key(&address, |c| c.address)
            .ok()
    }

    pub fn channel_by_name(&self, name: &str) -> Option<&ChannelInfo> {
        self.channels.iter().find(|c| c.name == name)
    }

    /// Samples of look-back memory each waveform reader retains.
    pub fn memory_samples(&self) -> usize {
        self.ring.memory_blocks * self.frames_per_block()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AllChannels, ControllerVariant, WaveformKind};

    struct Picked(Vec<StreamChannelAddress>);

    impl SignalSources for Picked {
        fn amplifier_channels(&self) -> Vec<ChannelInfo> {
            self.0
                .iter()
                .map(|&address| ChannelInfo {
                    address,
                    name: format!("ch{}-{}", address.stream, address.channel),
                    views: vec![WaveformKind::Wide],
                })
                .collect()
        }
    }

    #[test]
    fn channels_are_sorted_and_indexed() {
        let session = SessionContext::new(
            AcquisitionConfig::default(),
            FilterSettings::default(),
            DetectorSettings::default(),
            WaveformRingConfig::default(),
            &Picked(vec![
                StreamChannelAddress::new(1, 3),
                StreamChannelAddress::new(0, 7),
            ]),
        )
        .unwrap();
        assert_eq!(session.channels[0].address, StreamChannelAddress::new(0, 7));
        assert_eq!(
            session.channel_index(StreamChannelAddress::new(1, 3)),
            Some(1)
        );
        assert_eq!(session.channel_by_name("ch1-3").unwrap().address.channel, 3);
        assert_eq!(session.memory_samples(), 128 * 128);
    }

    #[test]
    fn channel_outside_streams_is_rejected() {
        let err = SessionContext::new(
            AcquisitionConfig::default(),
            FilterSettings::default(),
            DetectorSettings::default(),
            WaveformRingConfig::default(),
            &Picked(vec![StreamChannelAddress::new(5, 0)]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            SensorError::UnknownChannel(StreamChannelAddress::new(5, 0))
        );
    }

    #[test]
    fn all_channels_fill_session() {
        let acq = AcquisitionConfig {
            variant: ControllerVariant::StimRecord,
            num_streams: 2,
            ..AcquisitionConfig::default()
        };
        let sources = AllChannels::new(acq.variant, acq.num_streams);
        let session = SessionContext::new(
            acq,
            FilterSettings::default(),
            DetectorSettings::default(),
            WaveformRingConfig::default(),
            &sources,
        )
        .unwrap();
        assert_eq!(session.channels.len(), 32);
    }
}
