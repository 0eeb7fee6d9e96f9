use std::collections::HashMap;

use neuro_sensor::frame::{ADC_CHANNELS, DAC_CHANNELS};
use neuro_types::{ControllerVariant, SessionContext, WaveformKind};

use crate::error::WaveformError;

/// Dense handle for one published waveform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaveformId(pub(crate) usize);

impl WaveformId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    kind: WaveformKind,
}

/// Names every waveform a session publishes.
///
/// Amplifier views are `"{channel}|{SUFFIX}"`, e.g. `A-005|HIGH`. Board-level signals are
/// `"{STREAM}|AUX{n}"`, `ANALOG-IN-{n}`, `ANALOG-OUT-{n}`, `DIGITAL-IN` and `DIGITAL-OUT`,
/// with `n` counted from 1.
#[derive(Debug, Clone)]
pub struct WaveformCatalog {
    variant: ControllerVariant,
    entries: Vec<Entry>,
    by_name: HashMap<String, WaveformId>,
    /// `[channel index][view]`.
    amplifier: Vec<HashMap<WaveformKind, WaveformId>>,
    /// `[slot * num_streams + stream]`.
    aux: Vec<WaveformId>,
    analog_in: Vec<WaveformId>,
    analog_out: Vec<WaveformId>,
    digital_in: WaveformId,
    digital_out: WaveformId,
}

impl WaveformCatalog {
    pub fn new(session: &SessionContext) -> Self {
        let acq = &session.acquisition;
        let variant = acq.variant;
        let mut catalog = Self {
            variant,
            entries: Vec::new(),
            by_name: HashMap::new(),
            amplifier: Vec::with_capacity(session.channels.len()),
            aux: Vec::new(),
            analog_in: Vec::new(),
            analog_out: Vec::new(),
            digital_in: WaveformId(0),
            digital_out: WaveformId(0),
        };

        for channel in &session.channels {
            let views = channel
                .views
                .iter()
                .map(|&kind| {
                    let name = format!("{}|{}", channel.name, kind.suffix());
                    (kind, catalog.push(name, kind))
                })
                .collect();
            catalog.amplifier.push(views);
        }
        for slot in 0..variant.aux_slots() {
            for stream in 0..acq.num_streams {
                let name = format!("STREAM-{}|{}{}", stream, WaveformKind::Aux.suffix(), slot + 1);
                let id = catalog.push(name, WaveformKind::Aux);
                catalog.aux.push(id);
            }
        }
        for i in 0..ADC_CHANNELS {
            let name = format!("{}-{}", WaveformKind::AnalogIn.suffix(), i + 1);
            let id = catalog.push(name, WaveformKind::AnalogIn);
            catalog.analog_in.push(id);
        }
        if variant.has_stimulation() {
            for i in 0..DAC_CHANNELS {
                let name = format!("{}-{}", WaveformKind::AnalogOut.suffix(), i + 1);
                let id = catalog.push(name, WaveformKind::AnalogOut);
                catalog.analog_out.push(id);
            }
        }
        catalog.digital_in = catalog.push(
            WaveformKind::DigitalIn.suffix().to_string(),
            WaveformKind::DigitalIn,
        );
        catalog.digital_out = catalog.push(
            WaveformKind::DigitalOut.suffix().to_string(),
            WaveformKind::DigitalOut,
        );
        catalog
    }

    fn push(&mut self, name: String, kind: WaveformKind) -> WaveformId {
        let id = WaveformId(self.entries.len());
        self.by_name.insert(name.clone(), id);
        self.entries.push(Entry { name, kind });
        id
    }

    pub fn variant(&self) -> ControllerVariant {
        self.variant
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn id(&self, name: &str) -> Result<WaveformId, WaveformError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| WaveformError::UnknownWaveform(name.to_string()))
    }

    pub fn name(&self, id: WaveformId) -> &str {
        &self.entries[id.0].name
    }

    pub fn kind(&self, id: WaveformId) -> WaveformKind {
        self.entries[id.0].kind
    }

    /// View `kind` of the channel at `channel_index` in session order, if published.
    pub fn amplifier(&self, channel_index: usize, kind: WaveformKind) -> Option<WaveformId> {
        self.amplifier.get(channel_index)?.get(&kind).copied()
    }

    pub fn aux(&self, slot: usize, stream: usize, num_streams: usize) -> Option<WaveformId> {
        self.aux.get(slot * num_streams + stream).copied()
    }

    pub fn analog_in(&self, index: usize) -> Option<WaveformId> {
        self.analog_in.get(index).copied()
    }

    pub fn analog_out(&self, index: usize) -> Option<WaveformId> {
        self.analog_out.get(index).copied()
    }

    pub fn digital_in(&self) -> WaveformId {
        self.digital_in
    }

    pub fn digital_out(&self) -> WaveformId {
        self.digital_out
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }
}
