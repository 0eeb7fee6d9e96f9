//! Chip identification from ROM register reads returned in auxiliary slots.

use log::warn;

/// ROM registers 40..=44 spell this on every genuine chip.
pub const COMPANY_SIGNATURE: &[u8; 5] = b"INTAN";

/// Chip family reported by ROM register 63.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipKind {
    Rhd2132,
    Rhd2216,
    Rhd2164,
    Rhs2116,
    Unknown(u8),
}

impl ChipKind {
    pub fn from_chip_id(id: u8) -> Self {
        match id {
            1 => ChipKind::Rhd2132,
            2 => ChipKind::Rhd2216,
            4 => ChipKind::Rhd2164,
            32 => ChipKind::Rhs2116,
            other => ChipKind::Unknown(other),
        }
    }

    pub fn amplifier_count(self) -> usize {
        match self {
            ChipKind::Rhd2132 => 32,
            ChipKind::Rhd2216 | ChipKind::Rhs2116 => 16,
            ChipKind::Rhd2164 => 64,
            ChipKind::Unknown(_) => 0,
        }
    }
}

/// Which MISO line of a 64-channel chip a stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisoLine {
    A,
    B,
}

const MISO_A_MARKER: u8 = 0x35;
const MISO_B_MARKER: u8 = 0x3a;

/// Register values read back from one stream during chip detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomReadback {
    /// Registers 40..=44.
    pub signature: [u8; 5],
    /// Register 59, the MISO marker on 64-channel chips.
    pub miso_marker: u8,
    /// Register 63.
    pub chip_id: u8,
}

impl RomReadback {
    /// Register reads come back in the low byte of an auxiliary result word.
    pub fn from_aux_words(signature: [u16; 5], miso_marker: u16, chip_id: u16) -> Self {
        Self {
            signature: signature.map(|w| (w & 0xff) as u8),
            miso_marker: (miso_marker & 0xff) as u8,
            chip_id: (chip_id & 0xff) as u8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipIdentity {
    pub kind: ChipKind,
    pub miso: Option<MisoLine>,
}

/// Identifies a stream's chip. `None` when the signature does not match, which is
/// what an empty port reads as.
pub fn identify(readback: &RomReadback) -> Option<ChipIdentity> {
    if &readback.signature != COMPANY_SIGNATURE {
        return None;
    }
    let kind = ChipKind::from_chip_id(readback.chip_id);
    let miso = match kind {
        ChipKind::Rhd2164 => match readback.miso_marker {
            MISO_A_MARKER => Some(MisoLine::A),
            MISO_B_MARKER => Some(MisoLine::B),
            other => {
                warn!("RHD2164 reported unexpected MISO marker {:#04x}", other);
                None
            }
        },
        ChipKind::Unknown(id) => {
            warn!("Signature matched but chip id {} is unknown", id);
            None
        }
        _ => None,
    };
    Some(ChipIdentity { kind, miso })
}
