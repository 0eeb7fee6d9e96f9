use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error};
use neuro_types::{StimFlags, TtlLines};

use super::{FrameError, FrameLayout, ADC_CHANNELS, DAC_CHANNELS, HEADER_WORDS};

/// All fields of one decoded frame, in their raw 16-bit codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSamples {
    pub timestamp: u32,
    /// Indexed `[slot * num_streams + stream]`.
    pub aux: Vec<u16>,
    /// Indexed `[channel * num_streams + stream]`.
    pub amplifier: Vec<u16>,
    /// Stimulation frames only; same indexing as `amplifier`.
    pub dc_amplifier: Vec<u16>,
    /// Stimulation frames only; one word per stream.
    pub aux0_repeat: Vec<u16>,
    /// Stimulation frames only; one entry per stream.
    pub stim: Vec<StimFlags>,
    pub dac: [u16; DAC_CHANNELS],
    pub adc: [u16; ADC_CHANNELS],
    pub digital_in: TtlLines,
    pub digital_out: TtlLines,
}

impl FrameSamples {
    /// A frame of the right shape for `layout`, every code zero.
    pub fn new(layout: &FrameLayout) -> Self {
        let streams = layout.num_streams();
        let amp = layout.channels_per_stream() * streams;
        let stim = layout.variant().has_stimulation();
        Self {
            timestamp: 0,
            aux: vec![0; layout.aux_slots() * streams],
            amplifier: vec![0; amp],
            dc_amplifier: if stim { vec![0; amp] } else { Vec::new() },
            aux0_repeat: if stim { vec![0; streams] } else { Vec::new() },
            stim: if stim {
                vec![StimFlags::default(); streams]
            } else {
                Vec::new()
            },
            dac: [0; DAC_CHANNELS],
            adc: [0; ADC_CHANNELS],
            digital_in: TtlLines::default(),
            digital_out: TtlLines::default(),
        }
    }

    fn check_shape(&self, layout: &FrameLayout) -> Result<(), FrameError> {
        let expected = FrameSamples::new(layout);
        let shapes = [
            ("aux", self.aux.len(), expected.aux.len()),
            ("amplifier", self.amplifier.len(), expected.amplifier.len()),
            ("dc_amplifier", self.dc_amplifier.len(), expected.dc_amplifier.len()),
            ("aux0_repeat", self.aux0_repeat.len(), expected.aux0_repeat.len()),
            ("stim", self.stim.len(), expected.stim.len()),
        ];
        for (field, got, want) in shapes {
            if got != want {
                return Err(FrameError::LayoutMismatch(format!(
                    "{} holds {} entries, layout expects {}",
                    field, got, want
                )));
            }
        }
        Ok(())
    }
}

/// Encodes and decodes frames for one layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    layout: FrameLayout,
    magic: [u16; HEADER_WORDS],
}

impl FrameCodec {
    pub fn new(layout: FrameLayout) -> Self {
        Self {
            layout,
            magic: layout.variant().magic_words(),
        }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn words_per_frame(&self) -> usize {
        self.layout.words_per_frame()
    }

    /// True when a full header sits at `at`.
    pub fn has_magic(&self, words: &[u16], at: usize) -> bool {
        words
            .get(at..at + HEADER_WORDS)
            .map_or(false, |h| h == self.magic)
    }

    fn header_value(words: &[u16], at: usize) -> u64 {
        words[at..at + HEADER_WORDS]
            .iter()
            .rev()
            .fold(0u64, |acc, &w| (acc << 16) | u64::from(w))
    }

    /// Checks the header of every frame in `words` (a whole number of frames).
    pub fn check_block(&self, words: &[u16]) -> Result<(), FrameError> {
        let wpf = self.words_per_frame();
        for offset in (0..words.len()).step_by(wpf) {
            if !self.has_magic(words, offset) {
                let found = if offset + HEADER_WORDS <= words.len() {
                    Self::header_value(words, offset)
                } else {
                    0
                };
                return Err(FrameError::BadMagic {
                    offset,
                    expected: self.layout.variant().magic(),
                    found,
                });
            }
        }
        Ok(())
    }

    /// Scans forward two words at a time for a header followed by another header
    /// exactly one frame later. Returns the word offset of the first.
    pub fn find_sync(&self, words: &[u16]) -> Result<usize, FrameError> {
        let wpf = self.words_per_frame();
        let mut offset = 0;
        while offset + wpf + HEADER_WORDS <= words.len() {
            if self.has_magic(words, offset) && self.has_magic(words, offset + wpf) {
                debug!("Frame alignment found at word {}", offset);
                return Ok(offset);
            }
            offset += 2;
        }
        error!(
            "Lost frame alignment: no header pair within {} words",
            words.len()
        );
        Err(FrameError::ResyncFailed {
            searched: words.len(),
        })
    }

    /// Timestamp of the frame at the start of `frame`.
    pub fn timestamp(&self, frame: &[u16]) -> Result<u32, FrameError> {
        let at = self.layout.timestamp_offset();
        match frame.get(at..at + 2) {
            Some(&[low, high]) => Ok(u32::from(low) | u32::from(high) << 16),
            _ => Err(FrameError::ShortFrame {
                needed: at + 2,
                got: frame.len(),
            }),
        }
    }

    /// Writes one frame into `out`, which must hold at least one frame of words.
    pub fn encode_into(&self, samples: &FrameSamples, out: &mut [u16]) -> Result<(), FrameError> {
        let l = &self.layout;
        let wpf = l.words_per_frame();
        if out.len() < wpf {
            return Err(FrameError::ShortFrame {
                needed: wpf,
                got: out.len(),
            });
        }
        samples.check_shape(l)?;
        let out = &mut out[..wpf];
        out.fill(0);
        out[..HEADER_WORDS].copy_from_slice(&self.magic);
        out[l.timestamp_offset()] = (samples.timestamp & 0xffff) as u16;
        out[l.timestamp_offset() + 1] = (samples.timestamp >> 16) as u16;

        let streams = l.num_streams();
        for slot in 0..l.aux_slots() {
            for stream in 0..streams {
                out[l.aux_offset(slot, stream)] = samples.aux[slot * streams + stream];
            }
        }
        for channel in 0..l.channels_per_stream() {
            for stream in 0..streams {
                let i = channel * streams + stream;
                out[l.amplifier_offset(channel, stream)] = samples.amplifier[i];
                if let Some(at) = l.dc_amplifier_offset(channel, stream) {
                    out[at] = samples.dc_amplifier[i];
                }
            }
        }
        if l.variant().has_stimulation() {
            for stream in 0..streams {
                if let Some(at) = l.aux0_repeat_offset(stream) {
                    out[at] = samples.aux0_repeat[stream];
                }
                let flags = &samples.stim[stream];
                let words = [
                    flags.stim_on.bits(),
                    flags.polarity.bits(),
                    flags.amp_settle.bits(),
                    flags.charge_recovery.bits(),
                ];
                for (flag, word) in words.into_iter().enumerate() {
                    if let Some(at) = l.stim_flag_offset(stream, flag) {
                        out[at] = word;
                    }
                }
            }
            for (i, &code) in samples.dac.iter().enumerate() {
                if let Some(at) = l.dac_offset(i) {
                    out[at] = code;
                }
            }
        }
        for (i, &code) in samples.adc.iter().enumerate() {
            out[l.adc_offset(i)] = code;
        }
        out[l.digital_in_offset()] = samples.digital_in.bits();
        out[l.digital_out_offset()] = samples.digital_out.bits();
        Ok(())
    }

    pub fn encode(&self, samples: &FrameSamples) -> Result<Vec<u16>, FrameError> {
        let mut out = vec![0; self.words_per_frame()];
        self.encode_into(samples, &mut out)?;
        Ok(out)
    }

    /// Decodes the frame at the start of `words` into `samples`, reusing its buffers.
    pub fn decode_into(&self, words: &[u16], samples: &mut FrameSamples) -> Result<(), FrameError> {
        let l = &self.layout;
        let wpf = l.words_per_frame();
        if words.len() < wpf {
            return Err(FrameError::ShortFrame {
                needed: wpf,
                got: words.len(),
            });
        }
        if !self.has_magic(words, 0) {
            return Err(FrameError::BadMagic {
                offset: 0,
                expected: l.variant().magic(),
                found: Self::header_value(words, 0),
            });
        }
        samples.check_shape(l)?;

        samples.timestamp = self.timestamp(words)?;
        let streams = l.num_streams();
        for slot in 0..l.aux_slots() {
            for stream in 0..streams {
                samples.aux[slot * streams + stream] = words[l.aux_offset(slot, stream)];
            }
        }
        for channel in 0..l.channels_per_stream() {
            for stream in 0..streams {
                let i = channel * streams + stream;
                samples.amplifier[i] = words[l.amplifier_offset(channel, stream)];
                if let Some(at) = l.dc_amplifier_offset(channel, stream) {
                    samples.dc_amplifier[i] = words[at];
                }
            }
        }
        if l.variant().has_stimulation() {
            for stream in 0..streams {
                if let Some(at) = l.aux0_repeat_offset(stream) {
                    samples.aux0_repeat[stream] = words[at];
                }
                let flag = |f: usize| {
                    l.stim_flag_offset(stream, f)
                        .map_or(0, |at| words[at])
                };
                samples.stim[stream] = StimFlags {
                    stim_on: neuro_types::ChannelMask::from_bits(flag(0)),
                    polarity: neuro_types::ChannelMask::from_bits(flag(1)),
                    amp_settle: neuro_types::ChannelMask::from_bits(flag(2)),
                    charge_recovery: neuro_types::ChannelMask::from_bits(flag(3)),
                };
            }
            for i in 0..DAC_CHANNELS {
                if let Some(at) = l.dac_offset(i) {
                    samples.dac[i] = words[at];
                }
            }
        } else {
            samples.dac = [0; DAC_CHANNELS];
        }
        for i in 0..ADC_CHANNELS {
            samples.adc[i] = words[l.adc_offset(i)];
        }
        samples.digital_in = TtlLines::from_bits(words[l.digital_in_offset()]);
        samples.digital_out = TtlLines::from_bits(words[l.digital_out_offset()]);
        Ok(())
    }

    pub fn decode(&self, words: &[u16]) -> Result<FrameSamples, FrameError> {
        let mut samples = FrameSamples::new(&self.layout);
        self.decode_into(words, &mut samples)?;
        Ok(samples)
    }

    /// Appends `words` to `out` as little-endian bytes.
    pub fn words_to_bytes(words: &[u16], out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + words.len() * 2, 0);
        LittleEndian::write_u16_into(words, &mut out[start..]);
    }

    /// Reads whole little-endian words from `bytes`; a trailing odd byte is ignored.
    pub fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
        let mut words = vec![0u16; bytes.len() / 2];
        LittleEndian::read_u16_into(&bytes[..words.len() * 2], &mut words);
        words
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuro_types::ControllerVariant;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_samples(layout: &FrameLayout, rng: &mut StdRng) -> FrameSamples {
        let mut s = FrameSamples::new(layout);
        s.timestamp = rng.gen();
        s.aux.iter_mut().for_each(|w| *w = rng.gen());
        s.amplifier.iter_mut().for_each(|w| *w = rng.gen());
        s.dc_amplifier.iter_mut().for_each(|w| *w = rng.gen());
        s.aux0_repeat.iter_mut().for_each(|w| *w = rng.gen());
        for flags in s.stim.iter_mut() {
            flags.stim_on = neuro_types::ChannelMask::from_bits(rng.gen());
            flags.polarity = neuro_types::ChannelMask::from_bits(rng.gen());
            flags.amp_settle = neuro_types::ChannelMask::from_bits(rng.gen());
            flags.charge_recovery = neuro_types::ChannelMask::from_bits(rng.gen());
        }
        if layout.variant().has_stimulation() {
            s.dac.iter_mut().for_each(|w| *w = rng.gen());
        }
        s.adc.iter_mut().for_each(|w| *w = rng.gen());
        s.digital_in = TtlLines::from_bits(rng.gen());
        s.digital_out = TtlLines::from_bits(rng.gen());
        s
    }

    proptest! {
        #[test]
        fn every_layout_round_trips(variant_idx in 0usize..3, streams in 1usize..=32, seed in any::<u64>()) {
            let variant = ControllerVariant::ALL[variant_idx];
            prop_assume!(streams <= variant.max_streams());
            let layout = FrameLayout::new(variant, streams).unwrap();
            let codec = FrameCodec::new(layout);
            let mut rng = StdRng::seed_from_u64(seed);
            let samples = random_samples(&layout, &mut rng);

            let words = codec.encode(&samples).unwrap();
            prop_assert_eq!(words.len(), layout.words_per_frame());
            prop_assert_eq!(codec.decode(&words).unwrap(), samples);
        }
    }

    #[test]
    fn wire_bytes_start_with_little_endian_magic() {
        let layout = FrameLayout::new(ControllerVariant::Usb3Record, 1).unwrap();
        let codec = FrameCodec::new(layout);
        let mut samples = FrameSamples::new(&layout);
        samples.timestamp = 0x0001_0002;
        let words = codec.encode(&samples).unwrap();

        let mut bytes = Vec::new();
        FrameCodec::words_to_bytes(&words, &mut bytes);
        assert_eq!(
            &bytes[..8],
            &ControllerVariant::Usb3Record.magic().to_le_bytes()
        );
        assert_eq!(&bytes[8..12], &[0x02, 0x00, 0x01, 0x00]);
        assert_eq!(FrameCodec::bytes_to_words(&bytes), words);
    }

    #[test]
    fn decode_rejects_foreign_magic() {
        let usb2 = FrameCodec::new(FrameLayout::new(ControllerVariant::Usb2Record, 1).unwrap());
        let usb3 = FrameCodec::new(FrameLayout::new(ControllerVariant::Usb3Record, 1).unwrap());
        let mut words = usb2
            .encode(&FrameSamples::new(usb2.layout()))
            .unwrap();
        words.resize(usb3.words_per_frame(), 0);
        assert!(matches!(
            usb3.decode(&words),
            Err(FrameError::BadMagic { offset: 0, .. })
        ));
    }

    #[test]
    fn decode_rejects_short_input() {
        let codec = FrameCodec::new(FrameLayout::new(ControllerVariant::StimRecord, 1).unwrap());
        let words = codec.encode(&FrameSamples::new(codec.layout())).unwrap();
        assert!(matches!(
            codec.decode(&words[..words.len() - 1]),
            Err(FrameError::ShortFrame { .. })
        ));
    }

    #[test]
    fn timestamp_needs_the_whole_field() {
        let codec = FrameCodec::new(FrameLayout::new(ControllerVariant::Usb2Record, 1).unwrap());
        let mut samples = FrameSamples::new(codec.layout());
        samples.timestamp = 0x0012_3456;
        let words = codec.encode(&samples).unwrap();
        assert_eq!(codec.timestamp(&words).unwrap(), 0x0012_3456);
        assert!(matches!(
            codec.timestamp(&words[..HEADER_WORDS + 1]),
            Err(FrameError::ShortFrame { got, .. }) if got == HEADER_WORDS + 1
        ));
        assert!(codec.timestamp(&[]).is_err());
    }

    #[test]
    fn find_sync_recovers_after_garbage() {
        let layout = FrameLayout::new(ControllerVariant::Usb3Record, 2).unwrap();
        let codec = FrameCodec::new(layout);
        let frame = codec.encode(&FrameSamples::new(&layout)).unwrap();

        let mut stream = vec![0x1234u16; 10];
        for _ in 0..3 {
            stream.extend_from_slice(&frame);
        }
        assert_eq!(codec.find_sync(&stream), Ok(10));
        assert!(codec.check_block(&stream[10..]).is_ok());
        assert!(matches!(
            codec.check_block(&stream[..3 * layout.words_per_frame()]),
            Err(FrameError::BadMagic { offset: 0, .. })
        ));
    }

    #[test]
    fn lone_header_is_not_a_sync_point() {
        let layout = FrameLayout::new(ControllerVariant::Usb2Record, 1).unwrap();
        let codec = FrameCodec::new(layout);
        let frame = codec.encode(&FrameSamples::new(&layout)).unwrap();
        let mut stream = frame.clone();
        stream.extend(std::iter::repeat(0u16).take(layout.words_per_frame() + 8));
        assert!(matches!(
            codec.find_sync(&stream),
            Err(FrameError::ResyncFailed { .. })
        ));
    }
}
