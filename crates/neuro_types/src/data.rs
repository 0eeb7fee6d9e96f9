use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ControllerVariant;

/// Identifies one amplifier channel as (stream, channel-within-stream).
///
/// Ordering is stream-major, which is also the order channels are processed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamChannelAddress {
    pub stream: u16,
    pub channel: u16,
}

impl StreamChannelAddress {
    pub const fn new(stream: u16, channel: u16) -> Self {
        Self { stream, channel }
    }
}

impl fmt::Display for StreamChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream {} channel {}", self.stream, self.channel)
    }
}

macro_rules! define_bitset16 {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u16);

        impl $name {
            pub const WIDTH: usize = 16;

            pub const fn from_bits(bits: u16) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> u16 {
                self.0
            }

            /// Returns false for indices outside `0..16`.
            pub fn get(self, index: usize) -> bool {
                index < Self::WIDTH && (self.0 >> index) & 1 == 1
            }

            /// Sets one bit. Returns false, leaving the set untouched, when `index` is out of range.
            pub fn set(&mut self, index: usize, on: bool) -> bool {
                if index >= Self::WIDTH {
                    return false;
                }
                if on {
                    self.0 |= 1 << index;
                } else {
                    self.0 &= !(1 << index);
                }
                true
            }

            pub fn count_high(self) -> u32 {
                self.0.count_ones()
            }

            pub fn iter_high(self) -> impl Iterator<Item = usize> {
                (0..Self::WIDTH).filter(move |&i| (self.0 >> i) & 1 == 1)
            }
        }
    };
}

define_bitset16!(
    /// Sixteen TTL lines sampled once per frame.
    TtlLines
);

define_bitset16!(
    /// One bit per channel of a 16-channel stimulation stream.
    ChannelMask
);

/// Per-stream stimulation state carried by stimulation-capable frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StimFlags {
    pub stim_on: ChannelMask,
    pub polarity: ChannelMask,
    pub amp_settle: ChannelMask,
    pub charge_recovery: ChannelMask,
}

impl StimFlags {
    /// Packs the four flags of one channel into bits 0..4 (on, polarity, settle, recovery).
    pub fn channel_code(&self, channel: usize) -> u16 {
        u16::from(self.stim_on.get(channel))
            | u16::from(self.polarity.get(channel)) << 1
            | u16::from(self.amp_settle.get(channel)) << 2
            | u16::from(self.charge_recovery.get(channel)) << 3
    }
}

/// The waveform families the acquisition pipeline publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveformKind {
    Wide,
    Low,
    High,
    Spike,
    Dc,
    Stim,
    Aux,
    AnalogIn,
    AnalogOut,
    DigitalIn,
    DigitalOut,
}

impl WaveformKind {
    /// Suffix appended to a channel name to name one of its views.
    pub const fn suffix(self) -> &'static str {
        match self {
            WaveformKind::Wide => "WIDE",
            WaveformKind::Low => "LOW",
            WaveformKind::High => "HIGH",
            WaveformKind::Spike => "SPK",
            WaveformKind::Dc => "DC",
            WaveformKind::Stim => "STIM",
            WaveformKind::Aux => "AUX",
            WaveformKind::AnalogIn => "ANALOG-IN",
            WaveformKind::AnalogOut => "ANALOG-OUT",
            WaveformKind::DigitalIn => "DIGITAL-IN",
            WaveformKind::DigitalOut => "DIGITAL-OUT",
        }
    }

    /// Views derived from an amplifier channel.
    pub fn amplifier_views(variant: ControllerVariant) -> Vec<WaveformKind> {
        let mut views = vec![
            WaveformKind::Wide,
            WaveformKind::Low,
            WaveformKind::High,
            WaveformKind::Spike,
        ];
        if variant.has_stimulation() {
            views.push(WaveformKind::Dc);
            views.push(WaveformKind::Stim);
        }
        views
    }
}

/// Name and published views of one amplifier channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub address: StreamChannelAddress,
    pub name: String,
    pub views: Vec<WaveformKind>,
}

/// Supplies the enabled amplifier channels of a session, in processing order.
pub trait SignalSources: Send + Sync {
    fn amplifier_channels(&self) -> Vec<ChannelInfo>;
}

/// Enables every channel of every stream and names them by port, `A-000`, `A-001`, ...
///
/// Two streams share one port letter, matching dual-chip headstages.
#[derive(Debug, Clone)]
pub struct AllChannels {
    pub variant: ControllerVariant,
    pub num_streams: usize,
}

impl AllChannels {
    pub fn new(variant: ControllerVariant, num_streams: usize) -> Self {
        Self {
            variant,
            num_streams,
        }
    }

    pub fn channel_name(variant: ControllerVariant, address: StreamChannelAddress) -> String {
        let per_stream = variant.channels_per_stream();
        let port = (b'A' + (address.stream / 2) as u8) as char;
        let index = (address.stream as usize % 2) * per_stream + address.channel as usize;
        format!("{}-{:03}", port, index)
    }
}

impl SignalSources for AllChannels {
    fn amplifier_channels(&self) -> Vec<ChannelInfo> {
        let views = WaveformKind::amplifier_views(self.variant);
        let mut channels = Vec::with_capacity(self.num_streams * self.variant.channels_per_stream());
        for stream in 0..self.num_streams as u16 {
            for channel in 0..self.variant.channels_per_stream() as u16 {
                let address = StreamChannelAddress::new(stream, channel);
                channels.push(ChannelInfo {
                    address,
                    name: Self::channel_name(self.variant, address),
                    views: views.clone(),
                });
            }
        }
        channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitset_rejects_out_of_range_lines() {
        let mut lines = TtlLines::default();
        assert!(lines.set(3, true));
        assert!(lines.set(15, true));
        assert!(!lines.set(16, true));
        assert_eq!(lines.bits(), 0x8008);
        assert!(lines.get(3));
        assert!(!lines.get(16));
        assert_eq!(lines.iter_high().collect::<Vec<_>>(), vec![3, 15]);

        lines.set(3, false);
        assert_eq!(lines.count_high(), 1);
    }

    #[test]
    fn stim_channel_code_packs_flags() {
        let mut flags = StimFlags::default();
        flags.stim_on.set(2, true);
        flags.charge_recovery.set(2, true);
        flags.polarity.set(5, true);
        assert_eq!(flags.channel_code(2), 0b1001);
        assert_eq!(flags.channel_code(5), 0b0010);
        assert_eq!(flags.channel_code(0), 0);
    }

    #[test]
    fn addresses_order_stream_major() {
        let mut addrs = vec![
            StreamChannelAddress::new(1, 0),
            StreamChannelAddress::new(0, 31),
            StreamChannelAddress::new(0, 2),
        ];
        addrs.sort();
        assert_eq!(addrs[0], StreamChannelAddress::new(0, 2));
        assert_eq!(addrs[2], StreamChannelAddress::new(1, 0));
    }

    #[test]
    fn all_channels_names_ports() {
        let sources = AllChannels::new(ControllerVariant::Usb3Record, 3);
        let channels = sources.amplifier_channels();
        assert_eq!(channels.len(), 96);
        assert_eq!(channels[0].name, "A-000");
        assert_eq!(channels[32].name, "A-032");
        assert_eq!(channels[64].name, "B-000");
        assert_eq!(channels[0].views.len(), 4);

        let stim = AllChannels::new(ControllerVariant::StimRecord, 1).amplifier_channels();
        assert!(stim[0].views.contains(&WaveformKind::Dc));
    }
}
