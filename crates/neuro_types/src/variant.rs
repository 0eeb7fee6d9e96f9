//! Controller variants and the frame constants each one implies.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The three supported controller/wire variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerVariant {
    /// USB2 recording controller (RHD chips).
    Usb2Record,
    /// USB3 recording controller (RHD chips).
    Usb3Record,
    /// Stimulation/recording controller (RHS chips).
    StimRecord,
}

impl ControllerVariant {
    pub const ALL: [ControllerVariant; 3] = [
        ControllerVariant::Usb2Record,
        ControllerVariant::Usb3Record,
        ControllerVariant::StimRecord,
    ];

    /// 64-bit frame header magic, sent little-endian as four 16-bit words.
    pub const fn magic(self) -> u64 {
        match self {
            ControllerVariant::Usb2Record => 0xc691_1999_2702_1942,
            ControllerVariant::Usb3Record => 0xd7a2_2aaa_3813_2a53,
            ControllerVariant::StimRecord => 0x8d54_2c8a_4971_2f0b,
        }
    }

    /// Header magic split into the four words that appear on the wire.
    pub const fn magic_words(self) -> [u16; 4] {
        let m = self.magic();
        [
            (m & 0xffff) as u16,
            ((m >> 16) & 0xffff) as u16,
            ((m >> 32) & 0xffff) as u16,
            ((m >> 48) & 0xffff) as u16,
        ]
    }

    /// Frames per USB data block.
    pub const fn frames_per_block(self) -> usize {
        match self {
            ControllerVariant::Usb2Record => 60,
            ControllerVariant::Usb3Record | ControllerVariant::StimRecord => 128,
        }
    }

    pub const fn channels_per_stream(self) -> usize {
        match self {
            ControllerVariant::StimRecord => 16,
            _ => 32,
        }
    }

    /// Auxiliary command slots per stream.
    pub const fn aux_slots(self) -> usize {
        match self {
            ControllerVariant::StimRecord => 4,
            _ => 3,
        }
    }

    pub const fn max_streams(self) -> usize {
        match self {
            ControllerVariant::Usb2Record => 8,
            ControllerVariant::Usb3Record => 32,
            ControllerVariant::StimRecord => 8,
        }
    }

    /// Whether frames carry DC amplifier words, stimulation flags and DAC words.
    pub const fn has_stimulation(self) -> bool {
        matches!(self, ControllerVariant::StimRecord)
    }

    /// Filler words that pad the frame before the ADC block.
    pub const fn filler_words(self, num_streams: usize) -> usize {
        match self {
            ControllerVariant::Usb2Record => num_streams,
            _ => num_streams % 4,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ControllerVariant::Usb2Record => "usb2-record",
            ControllerVariant::Usb3Record => "usb3-record",
            ControllerVariant::StimRecord => "stim-record",
        }
    }
}

impl fmt::Display for ControllerVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_words_reassemble_little_endian() {
        for variant in ControllerVariant::ALL {
            let words = variant.magic_words();
            let rebuilt = words
                .iter()
                .rev()
                .fold(0u64, |acc, &w| (acc << 16) | u64::from(w));
            assert_eq!(rebuilt, variant.magic());
        }
        assert_eq!(ControllerVariant::Usb3Record.magic_words()[0], 0x2a53);
    }

    #[test]
    fn filler_depends_on_variant() {
        assert_eq!(ControllerVariant::Usb2Record.filler_words(6), 6);
        assert_eq!(ControllerVariant::Usb3Record.filler_words(6), 2);
        assert_eq!(ControllerVariant::StimRecord.filler_words(8), 0);
    }

    #[test]
    fn variants_deserialize_from_snake_case() {
        let v: ControllerVariant = serde_json::from_str("\"stim_record\"").unwrap();
        assert_eq!(v, ControllerVariant::StimRecord);
    }
}
