use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use acq_daemon::config::{DaemonConfig, SourceConfig};
use acq_daemon::csv_save::CsvSaveManager;
use acq_daemon::monitor::SpikeMonitor;
use anyhow::Context;
use clap::Parser;
use neuro_sensor::{FileReplaySource, FrameLayout, RawBlockSource, SyntheticSource};
use neuro_types::{BackendChoice, SessionContext};
use pipeline::{DiskRecorder, Executor, NamedSink, Trigger, WaveformCatalog};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Seconds of samples the spike monitor summarizes per log line.
const MONITOR_WINDOW_S: f64 = 5.0;

#[derive(Parser, Debug)]
#[command(name = "acq_daemon", about = "Neural recording acquisition daemon")]
struct Args {
    /// YAML configuration file
    #[arg(long, default_value = "configs/default.yaml")]
    config: PathBuf,
    /// Generate synthetic data instead of using the configured source
    #[arg(long, conflicts_with = "replay")]
    synthetic: bool,
    /// Replay a file of raw controller words
    #[arg(long)]
    replay: Option<PathBuf>,
    /// Processing backend: auto, cpu, device or gpu
    #[arg(long, value_parser = parse_backend)]
    backend: Option<BackendChoice>,
    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<f64>,
    /// Directory for recordings
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Do not write recordings
    #[arg(long)]
    no_record: bool,
}

fn parse_backend(s: &str) -> Result<BackendChoice, String> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| format!("unknown backend '{}', expected auto, cpu, device or gpu", s))
}

impl Args {
    fn apply(&self, config: &mut DaemonConfig) {
        if self.synthetic {
            if let SourceConfig::Replay { .. } = config.source {
                config.source = SourceConfig::default();
            }
        }
        if let Some(path) = &self.replay {
            config.source = SourceConfig::Replay { path: path.clone() };
        }
        if let Some(backend) = self.backend {
            config.executor.backend = backend;
        }
        if let Some(dir) = &self.output_dir {
            config.recording.output_dir = dir.clone();
        }
        if self.no_record {
            config.recording.enabled = false;
        }
    }
}

fn build_source(config: &DaemonConfig) -> anyhow::Result<Box<dyn RawBlockSource>> {
    let acq = &config.acquisition;
    let layout = FrameLayout::new(acq.variant, acq.num_streams)?;
    Ok(match &config.source {
        SourceConfig::Synthetic(synthetic) => {
            info!("Using synthetic source");
            Box::new(SyntheticSource::new(layout, acq.sample_rate_hz, synthetic.clone())?)
        }
        SourceConfig::Replay { path } => {
            info!("Replaying {}", path.display());
            Box::new(
                FileReplaySource::open(path, layout)
                    .with_context(|| format!("could not open {}", path.display()))?,
            )
        }
    })
}

fn build_sinks(config: &DaemonConfig, session: &SessionContext) -> anyhow::Result<Vec<NamedSink>> {
    let fs = session.sample_rate_hz();
    let mut sinks: Vec<NamedSink> = vec![(
        "monitor".to_string(),
        Box::new(SpikeMonitor::new(fs, MONITOR_WINDOW_S, 5)),
    )];
    let recording = &config.recording;
    if recording.enabled {
        let save = Box::new(CsvSaveManager::new(
            &recording.output_dir,
            recording.channels.clone(),
            recording.max_file_minutes,
            fs,
        ));
        let recorder = match &recording.trigger {
            Some(settings) => {
                let catalog = WaveformCatalog::new(session);
                let trigger = Trigger::new(settings, &catalog, fs, session.frames_per_block())?;
                DiskRecorder::triggered(save, trigger, fs)
            }
            None => DiskRecorder::continuous(save, fs),
        };
        sinks.push(("disk".to_string(), Box::new(recorder)));
    } else {
        info!("Recording disabled");
    }
    Ok(sinks)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "acq_daemon=info,pipeline=info,neuro_sensor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("Acquisition daemon starting...");

    let mut config = DaemonConfig::load(&args.config)?;
    args.apply(&mut config);
    info!("Loaded configuration from {}", args.config.display());

    let session = config.session()?;
    let source = build_source(&config)?;
    let sinks = build_sinks(&config, &session)?;
    let executor = Executor::start(Arc::clone(&session), source, sinks, config.executor.clone())
        .context("failed to start the pipeline")?;
    let stats = executor.stats();

    let deadline = args
        .duration
        .map(|seconds| Instant::now() + Duration::from_secs_f64(seconds.max(0.0)));
    let mut ticker =
        tokio::time::interval(Duration::from_secs_f64(config.status_interval_s.max(0.1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal.context("failed to listen for the shutdown signal")?;
                info!("Shutdown signal received. Stopping pipeline...");
                break;
            }
            _ = ticker.tick() => {
                let snapshot = stats.snapshot();
                info!("status {}", serde_json::to_string(&snapshot)?);
                if executor.stop_requested() {
                    warn!("A pipeline thread failed; shutting down.");
                    break;
                }
                if executor.source_exhausted() && executor.is_finished() {
                    info!(
                        "Source finished after {} blocks and every reader drained.",
                        snapshot.blocks_processed
                    );
                    break;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    info!("Run duration reached.");
                    break;
                }
            }
        }
    }

    tokio::task::spawn_blocking(move || executor.stop())
        .await
        .context("pipeline shutdown task failed")?
        .context("pipeline stopped with an error")?;
    info!("Acquisition daemon stopped gracefully.");
    Ok(())
}
