use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flume::Receiver;
use neuro_sensor::frame::HEADER_WORDS;
use neuro_sensor::{FrameCodec, FrameError, FrameSamples};
use neuro_types::{SessionContext, WaveformKind};
use tracing::{debug, error, info, warn};

use crate::allocator;
use crate::backend::{Backend, BackendSetup, BlockOutput, EngineCommand};
use crate::error::PipelineResult;
use crate::stats::PipelineStats;
use crate::sync::POLL_INTERVAL;
use crate::waveform::{WaveformCatalog, WaveformId, WaveformWriter};
use crate::word_ring::WordReader;

/// Wall time over which transformer utilisation is averaged.
const LOAD_WINDOW: Duration = Duration::from_millis(500);

/// Waveform ids of one amplifier channel, in session order.
#[derive(Debug, Clone, Copy)]
struct ChannelIds {
    stream: usize,
    channel: usize,
    wide: Option<WaveformId>,
    low: Option<WaveformId>,
    high: Option<WaveformId>,
    spike: Option<WaveformId>,
    dc: Option<WaveformId>,
    stim: Option<WaveformId>,
}

/// Board-level waveform ids, indexed the way `FrameSamples` stores the values.
#[derive(Debug, Clone)]
struct BoardIds {
    aux: Vec<WaveformId>,
    analog_in: Vec<WaveformId>,
    analog_out: Vec<WaveformId>,
    digital_in: WaveformId,
    digital_out: WaveformId,
}

#[derive(Debug, Clone)]
struct PublishMap {
    num_streams: usize,
    channels: Vec<ChannelIds>,
    board: BoardIds,
}

impl PublishMap {
    fn new(session: &SessionContext, catalog: &WaveformCatalog) -> Self {
        let num_streams = session.acquisition.num_streams;
        let view = |c, kind| catalog.amplifier(c, kind);
        let channels = session
            .channels
            .iter()
            .enumerate()
            .map(|(c, info)| ChannelIds {
                stream: info.address.stream as usize,
                channel: info.address.channel as usize,
                wide: view(c, WaveformKind::Wide),
                low: view(c, WaveformKind::Low),
                high: view(c, WaveformKind::High),
                spike: view(c, WaveformKind::Spike),
                dc: view(c, WaveformKind::Dc),
                stim: view(c, WaveformKind::Stim),
            })
            .collect();
        let slots = catalog.variant().aux_slots();
        let board = BoardIds {
            aux: (0..slots * num_streams)
                .filter_map(|i| catalog.aux(i / num_streams, i % num_streams, num_streams))
                .collect(),
            analog_in: (0..).map_while(|i| catalog.analog_in(i)).collect(),
            analog_out: (0..).map_while(|i| catalog.analog_out(i)).collect(),
            digital_in: catalog.digital_in(),
            digital_out: catalog.digital_out(),
        };
        Self {
            num_streams,
            channels,
            board,
        }
    }
}

/// Frame alignment tracking, so a loss episode is logged once.
#[derive(Debug, Default)]
struct Alignment {
    lost: bool,
    dropped: u64,
}

impl Alignment {
    fn lost(&mut self, offset: usize, dropped: usize, stats: &PipelineStats) {
        PipelineStats::add(&stats.framing_errors, 1);
        PipelineStats::add(&stats.words_dropped, dropped as u64);
        if !self.lost {
            error!(
                "Frame alignment lost at word {} of block, resynchronizing",
                offset
            );
            self.lost = true;
        } else {
            debug!("Still resynchronizing, dropped {} more words", dropped);
        }
        self.dropped += dropped as u64;
    }

    fn regained(&mut self) {
        if self.lost {
            warn!(
                "Frame alignment regained after dropping {} words",
                self.dropped
            );
            self.lost = false;
            self.dropped = 0;
        }
    }
}

/// Rolling busy-time over wall-time meter.
#[derive(Debug)]
struct LoadMeter {
    window_start: Instant,
    busy: Duration,
}

impl LoadMeter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            busy: Duration::ZERO,
        }
    }

    fn record(&mut self, busy: Duration, stats: &PipelineStats) {
        self.busy += busy;
        let wall = self.window_start.elapsed();
        if wall >= LOAD_WINDOW {
            let percent = self.busy.as_secs_f64() * 100.0 / wall.as_secs_f64();
            stats.set_transformer_load(percent as f32);
            self.window_start = Instant::now();
            self.busy = Duration::ZERO;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Processed,
    Resynced,
    Idle,
    Stopped,
}

/// Words to drop so the next read starts on a frame header.
fn resync_distance(codec: &FrameCodec, block: &[u16], bad_offset: usize) -> usize {
    let tail = &block[bad_offset..];
    match codec.find_sync(tail) {
        Ok(found) => bad_offset + found,
        Err(_) => {
            // Keep the unscanned tail; it may hold the start of the next good frame.
            let scanned = tail
                .len()
                .saturating_sub(codec.words_per_frame() + HEADER_WORDS);
            bad_offset + scanned - scanned % 2 + 2
        }
    }
}

/// Spike timestamps in a block assembled across a framing gap are taken from the frame
/// each spike falls in rather than counted from the block's first frame.
fn retime_spikes(codec: &FrameCodec, block: &[u16], out: &mut BlockOutput) -> PipelineResult<()> {
    let wpf = codec.words_per_frame();
    for spike in &mut out.spikes {
        let offset = spike.timestamp.wrapping_sub(out.base_timestamp) as i32;
        // Look-back spikes belong to the previous block.
        if offset < 0 || offset as usize >= out.frames {
            continue;
        }
        spike.timestamp = codec.timestamp(&block[offset as usize * wpf..])?;
    }
    Ok(())
}

/// Decodes, filters and publishes one block at a time.
pub struct Transformer {
    words: WordReader,
    codec: FrameCodec,
    backend: Backend,
    setup: BackendSetup,
    writer: WaveformWriter,
    commands: Receiver<EngineCommand>,
    stats: Arc<PipelineStats>,
    source_exhausted: Arc<AtomicBool>,
    map: PublishMap,
    out: BlockOutput,
    frame: FrameSamples,
    spike_codes: Vec<u16>,
    alignment: Alignment,
    /// Whole frames kept from before a framing error, completed by the next read.
    carry: Vec<u16>,
    load: LoadMeter,
}

impl Transformer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: &SessionContext,
        words: WordReader,
        backend: Backend,
        setup: BackendSetup,
        writer: WaveformWriter,
        commands: Receiver<EngineCommand>,
        stats: Arc<PipelineStats>,
        source_exhausted: Arc<AtomicBool>,
    ) -> PipelineResult<Self> {
        let map = PublishMap::new(session, writer.catalog());
        let frames = setup.layout.frames_per_block();
        let out = BlockOutput::new(setup.channels.len(), frames)?;
        let setup_words = setup.layout.words_per_block();
        Ok(Self {
            words,
            codec: FrameCodec::new(setup.layout),
            frame: FrameSamples::new(&setup.layout),
            spike_codes: vec![0; frames],
            backend,
            setup,
            writer,
            commands,
            stats,
            source_exhausted,
            map,
            out,
            alignment: Alignment::default(),
            carry: allocator::with_capacity(setup_words, "frame carry")?,
            load: LoadMeter::new(),
        })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Runs until `stop` is raised or an exhausted source has been drained.
    pub fn run(mut self, stop: &AtomicBool) -> PipelineResult<()> {
        info!("Transformer started on {} backend", self.backend.kind());
        let words_per_block = self.setup.layout.words_per_block();
        while !stop.load(Ordering::Relaxed) {
            self.apply_commands();
            let started = Instant::now();
            match self.step(stop)? {
                Step::Processed => self.load.record(started.elapsed(), &self.stats),
                Step::Resynced => {}
                Step::Idle => {
                    if self.source_exhausted.load(Ordering::Acquire)
                        && self.words.available() < words_per_block - self.carry.len()
                    {
                        info!("Source drained, transformer finishing");
                        break;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Step::Stopped => break,
            }
        }
        Ok(())
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match self.backend.apply(&command, &mut self.setup) {
                Ok(()) => info!("Applied engine command {:?}", command),
                Err(e) => error!("Rejected engine command {:?}: {}", command, e),
            }
        }
    }

    fn step(&mut self, stop: &AtomicBool) -> PipelineResult<Step> {
        let words_per_block = self.setup.layout.words_per_block();
        let Self {
            words,
            codec,
            backend,
            writer,
            stats,
            map,
            out,
            frame,
            spike_codes,
            alignment,
            carry,
            ..
        } = self;

        let need = words_per_block - carry.len();
        let Some(chunk) = words.try_pointer_read(need)? else {
            return Ok(Step::Idle);
        };
        if let Err(e) = codec.check_block(chunk) {
            let FrameError::BadMagic { offset, .. } = e else {
                return Err(e.into());
            };
            // A frame counts as good only when the next header is good too.
            let confirmed = offset.saturating_sub(codec.words_per_frame());
            carry.extend_from_slice(&chunk[..confirmed]);
            let dropped = resync_distance(codec, chunk, offset);
            alignment.lost(offset, dropped - confirmed, stats);
            words.release(dropped)?;
            return Ok(Step::Resynced);
        }
        alignment.regained();

        let assembled = !carry.is_empty();
        let block: &[u16] = if assembled {
            carry.extend_from_slice(chunk);
            carry.as_slice()
        } else {
            chunk
        };
        backend.process_block(block, out)?;
        if assembled {
            retime_spikes(codec, block, out)?;
        }
        // Waiting here is the backpressure point; a stop discards the processed block.
        if !writer.reserve_write(out.frames, stop)? {
            return Ok(Step::Stopped);
        }
        publish(writer, map, codec, out, frame, spike_codes, block)?;
        words.release(need)?;
        carry.clear();
        writer.commit()?;

        PipelineStats::add(&stats.blocks_processed, 1);
        PipelineStats::add(&stats.spikes_detected, out.spikes.len() as u64);
        stats.set_ring_fill(writer.percent_full());
        Ok(Step::Processed)
    }
}

/// Fills the open write reservation from one processed block.
fn publish(
    writer: &mut WaveformWriter,
    map: &PublishMap,
    codec: &FrameCodec,
    out: &BlockOutput,
    frame: &mut FrameSamples,
    spike_codes: &mut [u16],
    block: &[u16],
) -> PipelineResult<()> {
    for (c, ids) in map.channels.iter().enumerate() {
        if let Some(id) = ids.wide {
            writer.write(id, out.wide(c))?;
        }
        if let Some(id) = ids.low {
            writer.write(id, out.low(c))?;
        }
        if let Some(id) = ids.high {
            writer.write(id, out.high(c))?;
        }
        if let Some(id) = ids.spike {
            for (code, &class) in spike_codes.iter_mut().zip(out.spike_ids(c)) {
                *code = u16::from(class);
            }
            writer.write(id, spike_codes)?;
        }
    }

    let board = &map.board;
    for (t, words) in block.chunks_exact(codec.words_per_frame()).enumerate() {
        codec.decode_into(words, frame)?;
        writer.set_timestamp(t, frame.timestamp)?;
        for (&id, &v) in board.aux.iter().zip(&frame.aux) {
            writer.set(id, t, v)?;
        }
        for (&id, &v) in board.analog_in.iter().zip(&frame.adc) {
            writer.set(id, t, v)?;
        }
        for (&id, &v) in board.analog_out.iter().zip(&frame.dac) {
            writer.set(id, t, v)?;
        }
        writer.set(board.digital_in, t, frame.digital_in.bits())?;
        writer.set(board.digital_out, t, frame.digital_out.bits())?;

        for ids in &map.channels {
            if let Some(id) = ids.dc {
                let v = frame.dc_amplifier[ids.channel * map.num_streams + ids.stream];
                writer.set(id, t, v)?;
            }
            if let Some(id) = ids.stim {
                writer.set(id, t, frame.stim[ids.stream].channel_code(ids.channel))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{diagnostic_blocks, BackendKind};
    use crate::waveform::{waveform_ring, WaveformReader};
    use crate::word_ring::{word_ring, WordRingConfig, WordWriter};
    use flume::Sender;
    use neuro_types::{
        AcquisitionConfig, AllChannels, ControllerVariant, DetectorSettings, FilterSettings,
        StreamChannelAddress, WaveformRingConfig,
    };

    struct Rig {
        transformer: Transformer,
        words: WordWriter,
        reader: WaveformReader,
        commands: Sender<EngineCommand>,
        stats: Arc<PipelineStats>,
        blocks: Vec<Vec<u16>>,
    }

    fn rig(variant: ControllerVariant) -> Rig {
        let session = SessionContext::new(
            AcquisitionConfig {
                variant,
                num_streams: 1,
                ..AcquisitionConfig::default()
            },
            FilterSettings::default(),
            DetectorSettings::default(),
            WaveformRingConfig {
                capacity_blocks: 10,
                memory_blocks: 2,
                drain_margin_blocks: 1,
                max_write_blocks: 1,
            },
            &AllChannels::new(variant, 1),
        )
        .unwrap();
        let stats = Arc::new(PipelineStats::default());
        let setup = BackendSetup::from_session(&session).unwrap();
        let wpb = setup.layout.words_per_block();
        let (words, word_reader) = word_ring(
            WordRingConfig {
                capacity_words: 8 * wpb,
                max_burst_words: 4 * wpb,
                max_read_words: wpb,
                words_per_frame: setup.layout.words_per_frame(),
            },
            Arc::clone(&stats),
        )
        .unwrap();
        let (writer, mut readers) =
            waveform_ring(&session, &["test"], Arc::clone(&stats)).unwrap();
        let backend = Backend::new(BackendKind::Cpu, &setup).unwrap();
        let (commands, rx) = flume::unbounded();
        let blocks = diagnostic_blocks(&setup.layout, 4, 3).unwrap();
        let transformer = Transformer::new(
            &session,
            word_reader,
            backend,
            setup,
            writer,
            rx,
            Arc::clone(&stats),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        Rig {
            transformer,
            words,
            reader: readers.remove(0),
            commands,
            stats,
            blocks,
        }
    }

    fn push(words: &mut WordWriter, data: &[u16]) {
        let bytes: Vec<u8> = data.iter().flat_map(|w| w.to_le_bytes()).collect();
        words.write(&bytes, data.len()).unwrap();
    }

    #[test]
    fn publishes_filtered_and_board_waveforms() {
        let mut rig = rig(ControllerVariant::Usb2Record);
        let stop = AtomicBool::new(false);
        for block in &rig.blocks {
            push(&mut rig.words, block);
        }
        for _ in 0..4 {
            assert_eq!(rig.transformer.step(&stop).unwrap(), Step::Processed);
        }
        assert_eq!(rig.transformer.step(&stop).unwrap(), Step::Idle);

        let setup = rig.transformer.setup.clone();
        let mut expected = Backend::new(BackendKind::Cpu, &setup).unwrap();
        let mut out = BlockOutput::new(setup.channels.len(), 60).unwrap();
        let codec = FrameCodec::new(setup.layout);

        // Three blocks are readable; the fourth is the drain margin.
        assert!(rig.reader.reserve_read(180).unwrap());
        let catalog = rig.reader.catalog().clone();
        let wide = catalog.id("A-003|WIDE").unwrap();
        let high = catalog.id("A-003|HIGH").unwrap();
        let din = catalog.digital_in();
        let adc = catalog.analog_in(0).unwrap();
        for (b, block) in rig.blocks.iter().take(3).enumerate() {
            expected.process_block(block, &mut out).unwrap();
            for t in 0..60 {
                let at = (b * 60 + t) as isize;
                let decoded = codec
                    .decode(&block[t * codec.words_per_frame()..(t + 1) * codec.words_per_frame()])
                    .unwrap();
                assert_eq!(rig.reader.get(wide, at).unwrap(), out.wide(3)[t]);
                assert_eq!(rig.reader.get(high, at).unwrap(), out.high(3)[t]);
                assert_eq!(rig.reader.get(din, at).unwrap(), decoded.digital_in.bits());
                assert_eq!(rig.reader.get(adc, at).unwrap(), decoded.adc[0]);
                assert_eq!(rig.reader.timestamp(at).unwrap(), decoded.timestamp);
            }
        }
        rig.reader.release().unwrap();
        assert_eq!(rig.stats.snapshot().blocks_processed, 4);
    }

    #[test]
    fn stim_frames_publish_dc_and_stim_views() {
        let mut rig = rig(ControllerVariant::StimRecord);
        let stop = AtomicBool::new(false);
        for block in &rig.blocks {
            push(&mut rig.words, block);
        }
        for _ in 0..4 {
            assert_eq!(rig.transformer.step(&stop).unwrap(), Step::Processed);
        }
        let codec = FrameCodec::new(rig.transformer.setup.layout);
        let wpf = codec.words_per_frame();
        assert!(rig.reader.reserve_read(60).unwrap());
        let dc = rig.reader.catalog().id("A-002|DC").unwrap();
        let dac = rig.reader.catalog().id("ANALOG-OUT-1").unwrap();
        for t in 0..60 {
            let decoded = codec.decode(&rig.blocks[0][t * wpf..(t + 1) * wpf]).unwrap();
            assert_eq!(rig.reader.get(dc, t as isize).unwrap(), decoded.dc_amplifier[2]);
            assert_eq!(rig.reader.get(dac, t as isize).unwrap(), decoded.dac[0]);
        }
    }

    #[test]
    fn junk_words_are_skipped_and_counted() {
        let mut rig = rig(ControllerVariant::Usb2Record);
        let stop = AtomicBool::new(false);
        push(&mut rig.words, &[0xdead, 0xbeef, 0x1234, 0x5678, 0x0001, 0x0002]);
        for block in &rig.blocks {
            push(&mut rig.words, block);
        }
        assert_eq!(rig.transformer.step(&stop).unwrap(), Step::Resynced);
        let snap = rig.stats.snapshot();
        assert_eq!(snap.framing_errors, 1);
        assert_eq!(snap.words_dropped, 6);
        for _ in 0..4 {
            assert_eq!(rig.transformer.step(&stop).unwrap(), Step::Processed);
        }
        assert!(rig.reader.reserve_read(60).unwrap());
        assert_eq!(rig.reader.timestamp(0).unwrap(), 0);
    }

    #[test]
    fn confirmed_frames_before_a_bad_header_are_kept() {
        let mut rig = rig(ControllerVariant::Usb2Record);
        let stop = AtomicBool::new(false);
        let wpf = rig.transformer.codec.words_per_frame();
        // Two stray words land between frames 19 and 20 of the first block.
        let first = &rig.blocks[0];
        push(&mut rig.words, &first[..20 * wpf]);
        push(&mut rig.words, &[0xdead, 0xbeef]);
        push(&mut rig.words, &first[20 * wpf..]);
        for block in &rig.blocks[1..] {
            push(&mut rig.words, block);
        }

        assert_eq!(rig.transformer.step(&stop).unwrap(), Step::Resynced);
        let snap = rig.stats.snapshot();
        assert_eq!(snap.framing_errors, 1);
        // Frame 19 has no good header after it, so only it and the stray words go.
        assert_eq!(snap.words_dropped, (wpf + 2) as u64);
        for _ in 0..3 {
            assert_eq!(rig.transformer.step(&stop).unwrap(), Step::Processed);
        }
        assert_eq!(rig.transformer.step(&stop).unwrap(), Step::Idle);

        assert!(rig.reader.reserve_read(120).unwrap());
        let stamps: Vec<u32> = (0..120).map(|t| rig.reader.timestamp(t).unwrap()).collect();
        let expected: Vec<u32> = (0..19).chain(20..121).collect();
        assert_eq!(stamps, expected);
    }

    #[test]
    fn spikes_in_an_assembled_block_keep_their_frame_timestamps() {
        let rig = rig(ControllerVariant::Usb2Record);
        let codec = rig.transformer.codec;
        let wpf = codec.words_per_frame();
        // Frames 0..30 of one block followed by frames 60..90 of the stream.
        let mut block = rig.blocks[0][..30 * wpf].to_vec();
        block.extend_from_slice(&rig.blocks[1][..30 * wpf]);

        let mut out = BlockOutput::new(1, 60).unwrap();
        let channel = StreamChannelAddress::new(0, 0);
        out.spikes = [10u32, 45, u32::MAX]
            .into_iter()
            .map(|timestamp| neuro_types::SpikeEvent {
                timestamp,
                channel,
                class: neuro_types::SpikeClass::Unclassified,
            })
            .collect();
        retime_spikes(&codec, &block, &mut out).unwrap();
        let stamps: Vec<u32> = out.spikes.iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![10, 75, u32::MAX]);
    }

    #[test]
    fn resync_without_a_header_pair_keeps_the_tail() {
        let layout = neuro_sensor::FrameLayout::new(ControllerVariant::Usb2Record, 1).unwrap();
        let codec = FrameCodec::new(layout);
        let junk = vec![0u16; layout.words_per_block()];
        let dropped = resync_distance(&codec, &junk, 0);
        assert!(dropped > 0 && dropped <= junk.len());
        assert_eq!(dropped % 2, 0);
        assert!(junk.len() - dropped >= layout.words_per_frame() + HEADER_WORDS - 2);
    }

    #[test]
    fn commands_apply_between_blocks() {
        let mut rig = rig(ControllerVariant::Usb2Record);
        let channel = StreamChannelAddress::new(0, 5);
        rig.commands
            .send(EngineCommand::SetThreshold {
                channel,
                threshold_uv: -42.0,
            })
            .unwrap();
        rig.commands
            .send(EngineCommand::SetThreshold {
                channel: StreamChannelAddress::new(3, 0),
                threshold_uv: -1.0,
            })
            .unwrap();
        rig.commands
            .send(EngineCommand::SwitchBackend(BackendKind::Device))
            .unwrap();
        rig.transformer.apply_commands();

        let backend = rig.transformer.backend();
        assert_eq!(backend.kind(), BackendKind::Device);
        let states = backend.bank().states();
        assert_eq!(states[5].detector.threshold(), -42.0);
        assert_eq!(states[4].detector.threshold(), -70.0);
    }
}
