use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use neuro_sensor::SyntheticConfig;
use neuro_types::{
    AcquisitionConfig, AllChannels, DetectorSettings, FilterSettings, SessionContext,
    TriggerSettings, WaveformRingConfig,
};
use pipeline::ExecutorOptions;
use serde::{Deserialize, Serialize};

/// Where raw controller blocks come from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Synthetic(SyntheticConfig),
    /// Replays a file of little-endian controller words.
    Replay { path: PathBuf },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Synthetic(SyntheticConfig::default())
    }
}

/// Disk recording through the CSV save manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Channel names to save, e.g. `A-000`. Empty saves every channel.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Start a new file after this many minutes of recording.
    #[serde(default)]
    pub max_file_minutes: Option<u32>,
    /// Record only around trigger events. Absent records continuously.
    #[serde(default)]
    pub trigger: Option<TriggerSettings>,
}

fn default_true() -> bool {
    true
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./recordings")
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: default_output_dir(),
            channels: Vec::new(),
            max_file_minutes: None,
            trigger: None,
        }
    }
}

/// Configuration for the daemon
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub filters: FilterSettings,
    #[serde(default)]
    pub detector: DetectorSettings,
    #[serde(default)]
    pub ring: WaveformRingConfig,
    #[serde(default)]
    pub executor: ExecutorOptions,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    /// Seconds between status log lines.
    #[serde(default = "default_status_interval")]
    pub status_interval_s: f64,
}

fn default_status_interval() -> f64 {
    1.0
}

impl DaemonConfig {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read configuration file {}", path.display()))?;
        Self::from_yaml(&text)
            .with_context(|| format!("could not parse configuration file {}", path.display()))
    }

    /// Validates every section and builds the session shared by the pipeline.
    pub fn session(&self) -> anyhow::Result<Arc<SessionContext>> {
        let acq = &self.acquisition;
        let session = SessionContext::new(
            acq.clone(),
            self.filters.clone(),
            self.detector.clone(),
            self.ring.clone(),
            &AllChannels::new(acq.variant, acq.num_streams),
        )
        .context("invalid acquisition settings")?;
        for name in &self.recording.channels {
            if session.channel_by_name(name).is_none() {
                anyhow::bail!("recording channel '{}' is not part of this session", name);
            }
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuro_types::{ControllerVariant, TriggerSource};

    #[test]
    fn empty_document_uses_defaults() {
        let config = DaemonConfig::from_yaml("{}").unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert!(config.session().is_ok());
    }

    #[test]
    fn sections_override_defaults() {
        let config = DaemonConfig::from_yaml(
            r#"
acquisition:
  variant: usb2_record
  num_streams: 2
source:
  kind: replay
  path: /tmp/session.bin
recording:
  channels: [A-000, A-031]
  trigger:
    source: { type: digital, line: 3 }
    post_trigger_seconds: 1.5
"#,
        )
        .unwrap();
        assert_eq!(config.acquisition.variant, ControllerVariant::Usb2Record);
        assert_eq!(config.acquisition.num_streams, 2);
        assert_eq!(
            config.source,
            SourceConfig::Replay {
                path: PathBuf::from("/tmp/session.bin")
            }
        );
        let trigger = config.recording.trigger.clone().unwrap();
        assert_eq!(trigger.source, TriggerSource::Digital { line: 3 });
        assert_eq!(trigger.post_trigger_seconds, 1.5);
        assert_eq!(config.session().unwrap().channels.len(), 64);
    }

    #[test]
    fn unknown_recording_channel_is_rejected() {
        let mut config = DaemonConfig::default();
        config.recording.channels = vec!["Z-999".to_string()];
        assert!(config.session().is_err());
    }
}
