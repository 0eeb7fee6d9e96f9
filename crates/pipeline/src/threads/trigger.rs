//! Disk pump: continuous or trigger-gated recording through a [`SaveManager`].
//!
//! In triggered mode the recorder watches one digital line or analog input. Once it has
//! stayed active for the glitch window the recorder opens files, saves the pre-trigger
//! span before the first active sample out of retained history and then streams live
//! samples. Once the input has been inactive for the post-trigger
//! hold the files are closed and the recorder re-arms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use neuro_types::{seconds_to_samples, TriggerPolarity, TriggerSettings, TriggerSource};
use tracing::{info, warn};

use super::pump::ReaderSink;
use crate::error::{PipelineError, PipelineResult};
use crate::save::SaveManager;
use crate::waveform::{WaveformCatalog, WaveformId, WaveformReader};

#[derive(Debug, Clone, Copy)]
enum TriggerInput {
    Digital { id: WaveformId, line: usize },
    Analog { id: WaveformId, threshold_volts: f64 },
}

/// A trigger resolved against a session's waveforms, with durations in samples.
#[derive(Debug, Clone)]
pub struct Trigger {
    input: TriggerInput,
    active_high: bool,
    pre: usize,
    /// Consecutive active samples that open a recording.
    onset: usize,
    /// Inactive samples that end a recording.
    hold: usize,
    /// Block length to align the pre-trigger start to.
    align: Option<usize>,
}

impl Trigger {
    pub fn new(
        settings: &TriggerSettings,
        catalog: &WaveformCatalog,
        sample_rate_hz: f64,
        frames_per_block: usize,
    ) -> PipelineResult<Self> {
        let input = match settings.source {
            TriggerSource::Digital { line } => {
                if line >= 16 {
                    return Err(PipelineError::invalid_parameter(format!(
                        "trigger digital line {} out of range 0..16",
                        line
                    )));
                }
                TriggerInput::Digital {
                    id: catalog.digital_in(),
                    line,
                }
            }
            TriggerSource::Analog {
                input,
                threshold_volts,
            } => TriggerInput::Analog {
                id: catalog.analog_in(input).ok_or_else(|| {
                    PipelineError::invalid_parameter(format!(
                        "trigger analog input {} does not exist",
                        input
                    ))
                })?,
                threshold_volts,
            },
        };
        let samples = |seconds: f64| seconds_to_samples(seconds, sample_rate_hz);
        let glitch = samples(settings.glitch_ignore_seconds).max(1);
        // A stretch shorter than the glitch window never starts or ends a recording.
        let hold = samples(settings.post_trigger_seconds).max(glitch);
        Ok(Self {
            input,
            active_high: settings.polarity == TriggerPolarity::ActiveHigh,
            pre: samples(settings.pre_trigger_seconds),
            onset: glitch,
            hold,
            align: settings.align_to_blocks.then_some(frames_per_block),
        })
    }

    fn is_active(&self, reader: &WaveformReader, t: usize) -> PipelineResult<bool> {
        let t = t as isize;
        let level = match self.input {
            TriggerInput::Digital { id, line } => reader.digital_line(id, t, line)?,
            TriggerInput::Analog {
                id,
                threshold_volts,
            } => f64::from(reader.analog_in_volts(id, t)?) >= threshold_volts,
        };
        Ok(level == self.active_high)
    }

    /// Time index where saving starts for a trigger that went active at absolute sample
    /// `trigger`.
    ///
    /// The span reaches back `pre` samples but never before the reader's retained history
    /// or before samples an earlier recording already saved.
    fn pre_trigger_start(&self, reader: &WaveformReader, trigger: u64, saved_until: u64) -> isize {
        let position = reader.position();
        let earliest = (position - reader.memory_depth() as u64).max(saved_until);
        let mut start = trigger.saturating_sub(self.pre as u64).max(earliest);
        if let Some(block) = self.align {
            let block = block as u64;
            let down = start - start % block;
            if down >= earliest {
                start = down;
            } else if down + block <= trigger {
                start = down + block;
            }
        }
        start as isize - position as isize
    }
}

/// The disk pump's sink.
pub struct DiskRecorder {
    save: Box<dyn SaveManager>,
    trigger: Option<Trigger>,
    sample_rate_hz: f64,
    recording: Arc<AtomicBool>,
    /// Absolute position up to which samples have been handed to the save manager.
    saved_until: u64,
    /// Active samples seen so far while armed, and where that run began.
    active_run: usize,
    active_since: u64,
    inactive_run: usize,
}

impl DiskRecorder {
    /// Records everything from the first sample to the last.
    pub fn continuous(save: Box<dyn SaveManager>, sample_rate_hz: f64) -> Self {
        Self {
            save,
            trigger: None,
            sample_rate_hz,
            recording: Arc::new(AtomicBool::new(false)),
            saved_until: 0,
            active_run: 0,
            active_since: 0,
            inactive_run: 0,
        }
    }

    pub fn triggered(save: Box<dyn SaveManager>, trigger: Trigger, sample_rate_hz: f64) -> Self {
        Self {
            trigger: Some(trigger),
            ..Self::continuous(save, sample_rate_hz)
        }
    }

    /// Shared flag that is set while files are open.
    pub fn recording_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.recording)
    }

    fn open(&mut self, reader: &WaveformReader) -> PipelineResult<()> {
        self.save.open_files(reader)?;
        self.recording.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) -> PipelineResult<()> {
        self.recording.store(false, Ordering::Relaxed);
        self.save.close_files()
    }

    fn save(&mut self, reader: &WaveformReader, from: isize, to: isize) -> PipelineResult<()> {
        if to > from {
            self.save.write_samples(reader, (to - from) as usize, from)?;
            self.saved_until = (reader.position() as i64 + to as i64) as u64;
        }
        Ok(())
    }
}

impl ReaderSink for DiskRecorder {
    fn start(&mut self, reader: &WaveformReader) -> PipelineResult<()> {
        let mb = self
            .save
            .bytes_per_minute_estimate(reader.catalog(), self.sample_rate_hz)
            / 1e6;
        info!("Disk recorder expects about {:.1} MB per minute of recording", mb);
        if self.trigger.is_none() {
            self.open(reader)?;
        }
        Ok(())
    }

    fn consume(&mut self, reader: &WaveformReader, n: usize) -> PipelineResult<()> {
        let Some(trigger) = self.trigger.clone() else {
            return self.save(reader, 0, n as isize);
        };

        let mut run_start = 0isize;
        for t in 0..n {
            let active = trigger.is_active(reader, t)?;
            let recording = self.recording.load(Ordering::Relaxed);
            if recording {
                if active {
                    self.inactive_run = 0;
                    continue;
                }
                self.inactive_run += 1;
                if self.inactive_run >= trigger.hold {
                    self.save(reader, run_start, t as isize + 1)?;
                    self.close()?;
                    info!(
                        "Trigger released, recording closed at sample {}",
                        self.saved_until
                    );
                }
            } else if active {
                if self.active_run == 0 {
                    self.active_since = reader.position() + t as u64;
                }
                self.active_run += 1;
                if self.active_run < trigger.onset {
                    continue;
                }
                let start = trigger.pre_trigger_start(reader, self.active_since, self.saved_until);
                info!(
                    "Triggered at sample {}, saving {} pre-trigger samples",
                    self.active_since,
                    self.active_since as i64 - (reader.position() as i64 + start as i64)
                );
                self.open(reader)?;
                self.save(reader, start, t as isize)?;
                self.active_run = 0;
                self.inactive_run = 0;
                run_start = t as isize;
            } else {
                self.active_run = 0;
            }
        }
        if self.recording.load(Ordering::Relaxed) {
            self.save(reader, run_start, n as isize)?;
        }
        Ok(())
    }

    fn finish(&mut self, _reader: &WaveformReader) -> PipelineResult<()> {
        if self.recording.load(Ordering::Relaxed) {
            if self.trigger.is_some() {
                warn!("Stopping with a triggered recording still open");
            }
            self.close()?;
        }
        Ok(())
    }
}
