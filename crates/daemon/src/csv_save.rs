//! Save manager that records wideband amplifier samples to CSV files.

use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};

use chrono::Local;
use neuro_types::WaveformKind;
use pipeline::{PipelineError, PipelineResult, SaveManager, WaveformCatalog, WaveformId, WaveformReader};
use tracing::{debug, info};

/// Rough width of one CSV field, for size estimates.
const FIELD_BYTES: f64 = 9.0;

fn csv_error(err: csv::Error) -> PipelineError {
    PipelineError::Other(err.into())
}

struct OpenFile {
    path: PathBuf,
    writer: csv::Writer<File>,
    samples: u64,
}

/// Writes `timestamp` plus one microvolt column per selected channel.
pub struct CsvSaveManager {
    output_dir: PathBuf,
    channels: Vec<String>,
    /// Rotate to a new file after this many samples.
    max_file_samples: Option<u64>,
    columns: Vec<WaveformId>,
    header: Vec<String>,
    row: csv::StringRecord,
    file: Option<OpenFile>,
    files_opened: u32,
}

impl CsvSaveManager {
    /// `channels` names the amplifier channels to save; empty saves all of them.
    pub fn new(
        output_dir: impl Into<PathBuf>,
        channels: Vec<String>,
        max_file_minutes: Option<u32>,
        sample_rate_hz: f64,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            channels,
            max_file_samples: max_file_minutes
                .map(|m| (f64::from(m) * 60.0 * sample_rate_hz) as u64),
            columns: Vec::new(),
            header: Vec::new(),
            row: csv::StringRecord::new(),
            file: None,
            files_opened: 0,
        }
    }

    /// Path of the file currently being written.
    pub fn current_path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path.as_path())
    }

    fn wide_columns(&self, catalog: &WaveformCatalog) -> PipelineResult<Vec<(String, WaveformId)>> {
        if self.channels.is_empty() {
            return Ok(catalog
                .names()
                .filter_map(|name| {
                    let id = catalog.id(name).ok()?;
                    let channel = name.strip_suffix(&format!("|{}", WaveformKind::Wide.suffix()))?;
                    Some((channel.to_string(), id))
                })
                .collect());
        }
        self.channels
            .iter()
            .map(|channel| {
                let id = catalog.id(&format!("{}|{}", channel, WaveformKind::Wide.suffix()))?;
                Ok((channel.clone(), id))
            })
            .collect()
    }

    fn create_file(&mut self) -> PipelineResult<()> {
        if !self.output_dir.exists() {
            create_dir_all(&self.output_dir)?;
        }
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S%.3f");
        self.files_opened += 1;
        let path = self
            .output_dir
            .join(format!("recording_{}_{:03}.csv", stamp, self.files_opened));
        let mut writer = csv::Writer::from_path(&path).map_err(csv_error)?;
        writer.write_record(&self.header).map_err(csv_error)?;
        info!("Recording to {}", path.display());
        self.file = Some(OpenFile {
            path,
            writer,
            samples: 0,
        });
        Ok(())
    }

    fn close_file(&mut self) -> PipelineResult<()> {
        if let Some(mut file) = self.file.take() {
            file.writer.flush()?;
            info!("Closed {} after {} samples", file.path.display(), file.samples);
        }
        Ok(())
    }
}

impl SaveManager for CsvSaveManager {
    fn open_files(&mut self, reader: &WaveformReader) -> PipelineResult<()> {
        let columns = self.wide_columns(reader.catalog())?;
        if columns.is_empty() {
            return Err(PipelineError::invalid_configuration(
                "no amplifier channels selected for recording",
            ));
        }
        self.header = std::iter::once("timestamp".to_string())
            .chain(columns.iter().map(|(name, _)| format!("{}_uV", name)))
            .collect();
        self.columns = columns.into_iter().map(|(_, id)| id).collect();
        self.create_file()
    }

    fn write_samples(
        &mut self,
        reader: &WaveformReader,
        n: usize,
        start_offset: isize,
    ) -> PipelineResult<()> {
        for t in start_offset..start_offset + n as isize {
            let rotate = match (&self.file, self.max_file_samples) {
                (Some(file), Some(max)) => file.samples >= max,
                (None, _) => true,
                _ => false,
            };
            if rotate {
                self.close_file()?;
                self.create_file()?;
            }
            self.row.clear();
            self.row.push_field(&reader.timestamp(t)?.to_string());
            for &id in &self.columns {
                self.row
                    .push_field(&format!("{:.3}", reader.amplifier_microvolts(id, t)?));
            }
            if let Some(file) = self.file.as_mut() {
                file.writer.write_record(&self.row).map_err(csv_error)?;
                file.samples += 1;
            }
        }
        debug!("Wrote {} samples from offset {}", n, start_offset);
        Ok(())
    }

    fn close_files(&mut self) -> PipelineResult<()> {
        self.close_file()
    }

    fn bytes_per_minute_estimate(&self, catalog: &WaveformCatalog, sample_rate_hz: f64) -> f64 {
        let columns = self
            .wide_columns(catalog)
            .map(|c| c.len())
            .unwrap_or(self.channels.len());
        (columns + 1) as f64 * FIELD_BYTES * sample_rate_hz * 60.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuro_types::{
        AcquisitionConfig, AllChannels, ControllerVariant, DetectorSettings, FilterSettings,
        SessionContext, WaveformRingConfig,
    };
    use pipeline::{waveform_ring, PipelineStats};
    use std::sync::Arc;

    fn reader_with_block() -> WaveformReader {
        let session = SessionContext::new(
            AcquisitionConfig {
                variant: ControllerVariant::Usb2Record,
                num_streams: 1,
                ..AcquisitionConfig::default()
            },
            FilterSettings::default(),
            DetectorSettings::default(),
            WaveformRingConfig {
                capacity_blocks: 8,
                memory_blocks: 1,
                drain_margin_blocks: 1,
                max_write_blocks: 1,
            },
            &AllChannels::new(ControllerVariant::Usb2Record, 1),
        )
        .unwrap();
        let (mut writer, mut readers) =
            waveform_ring(&session, &["disk"], Arc::new(PipelineStats::default())).unwrap();
        let id = writer.catalog().id("A-002|WIDE").unwrap();
        let quiet = writer.catalog().id("A-003|WIDE").unwrap();
        for block in 0..2u32 {
            assert!(writer.try_reserve_write(60).unwrap());
            for t in 0..60 {
                writer.set_timestamp(t, block * 60 + t as u32).unwrap();
            }
            // 32768 + 10 codes is 1.95 uV.
            writer.write(id, &[32778; 60]).unwrap();
            writer.write(quiet, &[32768; 60]).unwrap();
            writer.commit().unwrap();
        }
        let mut reader = readers.remove(0);
        assert!(reader.reserve_read(60).unwrap());
        reader
    }

    #[test]
    fn writes_header_and_microvolt_rows() {
        let dir = tempfile::tempdir().unwrap();
        let reader = reader_with_block();
        let mut save = CsvSaveManager::new(
            dir.path(),
            vec!["A-002".to_string(), "A-003".to_string()],
            None,
            30_000.0,
        );
        save.open_files(&reader).unwrap();
        let path = save.current_path().unwrap().to_path_buf();
        save.write_samples(&reader, 60, 0).unwrap();
        save.close_files().unwrap();
        assert!(save.current_path().is_none());

        let mut csv = csv::Reader::from_path(&path).unwrap();
        let header: Vec<&str> = csv.headers().unwrap().iter().collect();
        assert_eq!(header, vec!["timestamp", "A-002_uV", "A-003_uV"]);
        let rows: Vec<csv::StringRecord> = csv.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 60);
        assert_eq!(&rows[0][0], "0");
        assert_eq!(&rows[59][0], "59");
        assert_eq!(&rows[7][1], "1.950");
        assert_eq!(&rows[7][2], "0.000");
    }

    #[test]
    fn rotates_after_the_file_limit() {
        let dir = tempfile::tempdir().unwrap();
        let reader = reader_with_block();
        // One minute at 0.5 Hz is 30 samples.
        let mut save = CsvSaveManager::new(dir.path(), vec!["A-000".to_string()], Some(1), 0.5);
        save.open_files(&reader).unwrap();
        save.write_samples(&reader, 60, 0).unwrap();
        save.close_files().unwrap();
        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 2);
    }

    #[test]
    fn all_channels_when_none_selected() {
        let dir = tempfile::tempdir().unwrap();
        let reader = reader_with_block();
        let save = CsvSaveManager::new(dir.path(), Vec::new(), None, 30_000.0);
        let per_minute = save.bytes_per_minute_estimate(reader.catalog(), 30_000.0);
        assert_eq!(per_minute, 33.0 * FIELD_BYTES * 30_000.0 * 60.0);
    }
}
