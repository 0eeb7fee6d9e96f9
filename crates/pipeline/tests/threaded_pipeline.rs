use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use neuro_sensor::{FileReplaySource, FrameCodec, FrameLayout, FrameSamples, SyntheticConfig, SyntheticSource};
use neuro_types::{
    AcquisitionConfig, AllChannels, BackendChoice, ControllerVariant, DetectorSettings,
    FilterSettings, SessionContext, StreamChannelAddress, WaveformRingConfig,
};
use pipeline::{
    BackendKind, DiskRecorder, EngineCommand, Executor, ExecutorOptions, NamedSink,
    PipelineError, PipelineResult, ReaderSink, SaveManager, WaveformCatalog, WaveformReader,
};

const FS: f64 = 30_000.0;

fn session(variant: ControllerVariant) -> Arc<SessionContext> {
    SessionContext::new(
        AcquisitionConfig {
            variant,
            num_streams: 1,
            sample_rate_hz: FS,
            ..AcquisitionConfig::default()
        },
        FilterSettings::default(),
        DetectorSettings::default(),
        WaveformRingConfig {
            capacity_blocks: 16,
            memory_blocks: 2,
            drain_margin_blocks: 1,
            max_write_blocks: 1,
        },
        &AllChannels::new(variant, 1),
    )
    .unwrap()
}

fn options() -> ExecutorOptions {
    ExecutorOptions {
        backend: BackendChoice::Cpu,
        pin_threads: false,
        realtime_priority: false,
    }
}

fn unpaced_source(layout: FrameLayout) -> Box<SyntheticSource> {
    let config = SyntheticConfig {
        paced: false,
        ..SyntheticConfig::default()
    };
    Box::new(SyntheticSource::new(layout, FS, config).unwrap())
}

fn layout(session: &SessionContext) -> FrameLayout {
    FrameLayout::new(session.acquisition.variant, session.acquisition.num_streams).unwrap()
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

/// Records every timestamp it is handed.
struct Timestamps(Arc<Mutex<Vec<u32>>>);

impl ReaderSink for Timestamps {
    fn consume(&mut self, reader: &WaveformReader, n: usize) -> PipelineResult<()> {
        let mut seen = self.0.lock().unwrap();
        for t in 0..n as isize {
            seen.push(reader.timestamp(t)?);
        }
        Ok(())
    }
}

#[derive(Default)]
struct Counts {
    opened: usize,
    closed: usize,
    samples: usize,
}

struct CountingSave(Arc<Mutex<Counts>>);

impl SaveManager for CountingSave {
    fn open_files(&mut self, _reader: &WaveformReader) -> PipelineResult<()> {
        self.0.lock().unwrap().opened += 1;
        Ok(())
    }

    fn write_samples(&mut self, _reader: &WaveformReader, n: usize, _start: isize) -> PipelineResult<()> {
        self.0.lock().unwrap().samples += n;
        Ok(())
    }

    fn close_files(&mut self) -> PipelineResult<()> {
        self.0.lock().unwrap().closed += 1;
        Ok(())
    }

    fn bytes_per_minute_estimate(&self, catalog: &WaveformCatalog, sample_rate_hz: f64) -> f64 {
        catalog.len() as f64 * 2.0 * sample_rate_hz * 60.0
    }
}

fn assert_consecutive(stamps: &[u32]) {
    assert_eq!(stamps.first().copied(), Some(0));
    for w in stamps.windows(2) {
        assert_eq!(w[1], w[0] + 1, "gap after timestamp {}", w[0]);
    }
}

#[test]
fn synthetic_source_flows_to_every_reader() {
    let _ = tracing_subscriber::fmt::try_init();
    let session = session(ControllerVariant::Usb2Record);
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let counts = Arc::new(Mutex::new(Counts::default()));
    let sinks: Vec<NamedSink> = vec![
        ("display".to_string(), Box::new(Timestamps(Arc::clone(&stamps)))),
        (
            "disk".to_string(),
            Box::new(DiskRecorder::continuous(Box::new(CountingSave(Arc::clone(&counts))), FS)),
        ),
    ];
    let executor = Executor::start(
        Arc::clone(&session),
        unpaced_source(layout(&session)),
        sinks,
        options(),
    )
    .unwrap();
    assert_eq!(executor.initial_backend(), BackendKind::Cpu);

    let stats = executor.stats();
    wait_for("50 blocks", || stats.snapshot().blocks_processed >= 50);
    executor
        .control()
        .send(EngineCommand::SetThreshold {
            channel: StreamChannelAddress::new(0, 3),
            threshold_uv: -55.0,
        })
        .unwrap();
    executor
        .control()
        .send(EngineCommand::SwitchBackend(BackendKind::Device))
        .unwrap();
    let after_switch = stats.snapshot().blocks_processed;
    wait_for("more blocks after the switch", || {
        stats.snapshot().blocks_processed >= after_switch + 20
    });
    wait_for("the display reader", || stamps.lock().unwrap().len() >= 20 * 60);
    assert!(!executor.stop_requested());
    executor.stop().unwrap();

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.overruns, 0);
    assert_eq!(snapshot.framing_errors, 0);
    assert_consecutive(&stamps.lock().unwrap());
    let counts = counts.lock().unwrap();
    assert_eq!((counts.opened, counts.closed), (1, 1));
    assert!(counts.samples >= 60);
}

#[test]
fn replayed_file_is_processed_to_the_end() {
    let session = session(ControllerVariant::Usb2Record);
    let layout = layout(&session);
    let codec = FrameCodec::new(layout);
    let blocks = 30;
    let mut bytes = Vec::new();
    let mut frame = FrameSamples::new(&layout);
    frame.amplifier.fill(32768);
    for t in 0..(blocks * layout.frames_per_block()) as u32 {
        frame.timestamp = t;
        FrameCodec::words_to_bytes(&codec.encode(&frame).unwrap(), &mut bytes);
    }
    let path = std::env::temp_dir().join(format!("replay-pipeline-{}.bin", std::process::id()));
    std::fs::File::create(&path).unwrap().write_all(&bytes).unwrap();

    let stamps = Arc::new(Mutex::new(Vec::new()));
    let sinks: Vec<NamedSink> = vec![("display".to_string(), Box::new(Timestamps(Arc::clone(&stamps))))];
    let source = Box::new(FileReplaySource::open(&path, layout).unwrap());
    let executor = Executor::start(Arc::clone(&session), source, sinks, options()).unwrap();
    let stats = executor.stats();
    wait_for("the end of the file", || {
        executor.source_exhausted() && stats.snapshot().blocks_processed == blocks as u64
    });
    // Every thread returns by itself once the reader has drained the tail.
    wait_for("the pipeline to finish", || executor.is_finished());
    assert!(!executor.stop_requested());
    executor.stop().unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(stats.snapshot().spikes_detected, 0);
    let stamps = stamps.lock().unwrap();
    assert_consecutive(&stamps);
    assert_eq!(stamps.len(), blocks * layout.frames_per_block());
}

struct FailsAfter(usize);

impl ReaderSink for FailsAfter {
    fn consume(&mut self, _reader: &WaveformReader, _n: usize) -> PipelineResult<()> {
        if self.0 == 0 {
            return Err(PipelineError::invalid_parameter("sink gave up"));
        }
        self.0 -= 1;
        Ok(())
    }
}

#[test]
fn failing_reader_stops_the_pipeline() {
    let session = session(ControllerVariant::Usb2Record);
    let sinks: Vec<NamedSink> = vec![("flaky".to_string(), Box::new(FailsAfter(3)))];
    let executor =
        Executor::start(Arc::clone(&session), unpaced_source(layout(&session)), sinks, options())
            .unwrap();
    wait_for("the stop flag", || executor.stop_requested());
    match executor.stop() {
        Err(PipelineError::InvalidParameter { message }) => assert_eq!(message, "sink gave up"),
        other => panic!("expected the sink's error, got {:?}", other),
    }
}

#[test]
fn start_rejects_bad_wiring() {
    let session = session(ControllerVariant::Usb2Record);

    let usb3 = FrameLayout::new(ControllerVariant::Usb3Record, 1).unwrap();
    let result = Executor::start(Arc::clone(&session), unpaced_source(usb3), Vec::new(), options());
    assert!(matches!(result, Err(PipelineError::InvalidConfiguration { .. })));

    let stamps = Arc::new(Mutex::new(Vec::new()));
    let sinks: Vec<NamedSink> = vec![
        ("disk".to_string(), Box::new(Timestamps(Arc::clone(&stamps)))),
        ("disk".to_string(), Box::new(Timestamps(Arc::clone(&stamps)))),
    ];
    let result = Executor::start(
        Arc::clone(&session),
        unpaced_source(layout(&session)),
        sinks,
        options(),
    );
    assert!(matches!(result, Err(PipelineError::InvalidConfiguration { .. })));
}
