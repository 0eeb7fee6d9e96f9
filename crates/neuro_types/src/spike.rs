//! Spike events, classification codes and hoop definitions.

use serde::{Deserialize, Serialize};

use crate::StreamChannelAddress;

/// Units a channel can sort spikes into.
pub const MAX_UNITS: usize = 4;
/// Hoops per unit.
pub const MAX_HOOPS_PER_UNIT: usize = 4;

/// Classification attached to a detected crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpikeClass {
    NoSpike,
    /// Matched every active hoop of unit `0..MAX_UNITS`.
    Unit(u8),
    Unclassified,
    /// Snippet exceeded the artifact amplitude.
    Artifact,
}

impl SpikeClass {
    pub const NO_SPIKE_CODE: u8 = 0x00;
    pub const UNCLASSIFIED_CODE: u8 = 0x10;
    pub const ARTIFACT_CODE: u8 = 0x20;

    /// Code stored in the spike-id waveform. Units map to `1 << unit`.
    pub fn code(self) -> u8 {
        match self {
            SpikeClass::NoSpike => Self::NO_SPIKE_CODE,
            SpikeClass::Unit(unit) => 1 << unit,
            SpikeClass::Unclassified => Self::UNCLASSIFIED_CODE,
            SpikeClass::Artifact => Self::ARTIFACT_CODE,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            Self::NO_SPIKE_CODE => Some(SpikeClass::NoSpike),
            Self::UNCLASSIFIED_CODE => Some(SpikeClass::Unclassified),
            Self::ARTIFACT_CODE => Some(SpikeClass::Artifact),
            c if c.is_power_of_two() && c.trailing_zeros() < MAX_UNITS as u32 => {
                Some(SpikeClass::Unit(c.trailing_zeros() as u8))
            }
            _ => None,
        }
    }

    pub fn is_spike(self) -> bool {
        !matches!(self, SpikeClass::NoSpike)
    }
}

/// A detected threshold crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpikeEvent {
    /// Controller timestamp of the crossing sample.
    pub timestamp: u32,
    pub channel: StreamChannelAddress,
    pub class: SpikeClass,
}

/// A line segment a snippet must cross for a unit to match.
///
/// Times are sample indices into the snippet, whose crossing sits at the pre-trigger
/// offset. Values are in microvolts. `t_a <= t_b` after construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HoopDefinition {
    pub t_a: u16,
    pub y_a: f32,
    pub t_b: u16,
    pub y_b: f32,
}

impl HoopDefinition {
    pub const INACTIVE: HoopDefinition = HoopDefinition {
        t_a: 0,
        y_a: 0.0,
        t_b: 0,
        y_b: 0.0,
    };

    pub fn new(t_a: u16, y_a: f32, t_b: u16, y_b: f32) -> Self {
        if t_b < t_a {
            Self {
                t_a: t_b,
                y_a: y_b,
                t_b: t_a,
                y_b: y_a,
            }
        } else {
            Self { t_a, y_a, t_b, y_b }
        }
    }

    /// A hoop collapsed to a single point never constrains a unit.
    pub fn is_active(&self) -> bool {
        !(self.t_a == self.t_b && self.y_a == self.y_b)
    }

    pub fn is_vertical(&self) -> bool {
        self.t_a == self.t_b
    }
}

pub type UnitHoops = [HoopDefinition; MAX_HOOPS_PER_UNIT];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_codes_match_waveform_encoding() {
        assert_eq!(SpikeClass::NoSpike.code(), 0);
        assert_eq!(SpikeClass::Unit(0).code(), 1);
        assert_eq!(SpikeClass::Unit(3).code(), 8);
        assert_eq!(SpikeClass::Unclassified.code(), 0x10);
        assert_eq!(SpikeClass::Artifact.code(), 0x20);

        for code in [0u8, 1, 2, 4, 8, 0x10, 0x20] {
            assert_eq!(SpikeClass::from_code(code).map(SpikeClass::code), Some(code));
        }
        assert_eq!(SpikeClass::from_code(3), None);
        assert_eq!(SpikeClass::from_code(0x40), None);
    }

    #[test]
    fn hoop_endpoints_are_ordered() {
        let hoop = HoopDefinition::new(20, -50.0, 10, 30.0);
        assert_eq!((hoop.t_a, hoop.t_b), (10, 20));
        assert_eq!((hoop.y_a, hoop.y_b), (30.0, -50.0));
        assert!(hoop.is_active());
        assert!(!HoopDefinition::INACTIVE.is_active());
        assert!(HoopDefinition::new(5, -10.0, 5, 10.0).is_vertical());
    }
}
