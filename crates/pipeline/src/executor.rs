//! Builds the rings, starts the pipeline threads and stops them again.

use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use core_affinity::CoreId;
use flume::Sender;
use neuro_sensor::RawBlockSource;
use neuro_types::{BackendChoice, SessionContext};
use serde::{Deserialize, Serialize};
use thread_priority::ThreadPriority;
use tracing::{debug, error, info, warn};

use crate::backend::{select_backend, BackendKind, BackendSetup, EngineCommand};
use crate::error::{PipelineError, PipelineResult};
use crate::stats::PipelineStats;
use crate::threads::{Producer, ReaderPump, ReaderSink, Transformer};
use crate::waveform::waveform_ring;
use crate::word_ring::{word_ring, WordRingConfig};

/// A consumer to attach to the waveform ring, under the reader name it will use.
pub type NamedSink = (String, Box<dyn ReaderSink>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorOptions {
    #[serde(default)]
    pub backend: BackendChoice,
    /// Pin the producer and transformer to their own cores when possible.
    #[serde(default = "default_true")]
    pub pin_threads: bool,
    /// Raise the producer and transformer to maximum priority when permitted.
    #[serde(default = "default_true")]
    pub realtime_priority: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            backend: BackendChoice::default(),
            pin_threads: true,
            realtime_priority: true,
        }
    }
}

/// Sends [`EngineCommand`]s to the running transformer.
#[derive(Debug, Clone)]
pub struct EngineControl {
    tx: Sender<EngineCommand>,
}

impl EngineControl {
    /// Queues `command`; the transformer applies it before its next block.
    pub fn send(&self, command: EngineCommand) -> PipelineResult<()> {
        self.tx
            .send(command)
            .map_err(|e| PipelineError::ChannelError(format!("engine stopped: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Placement {
    core: Option<CoreId>,
    realtime: bool,
}

impl Placement {
    fn apply(self, name: &str) {
        if let Some(core) = self.core {
            if core_affinity::set_for_current(core) {
                debug!("Set affinity for '{}' to core {:?}", name, core);
            } else {
                warn!("Failed to set affinity for '{}' to core {:?}", name, core);
            }
        }
        if self.realtime {
            if let Err(e) = thread_priority::set_current_thread_priority(ThreadPriority::Max) {
                warn!("Failed to raise priority of '{}': {:?}", name, e);
            }
        }
    }
}

struct Worker {
    name: String,
    handle: thread::JoinHandle<PipelineResult<()>>,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// A running pipeline: one producer, one transformer and one pump per reader.
pub struct Executor {
    stop: Arc<AtomicBool>,
    source_exhausted: Arc<AtomicBool>,
    workers: Vec<Worker>,
    control: EngineControl,
    stats: Arc<PipelineStats>,
    backend: BackendKind,
}

impl Executor {
    /// Builds every buffer for `session` and starts the threads.
    ///
    /// Allocation and configuration errors surface here, before any thread runs.
    pub fn start(
        session: Arc<SessionContext>,
        source: Box<dyn RawBlockSource>,
        sinks: Vec<NamedSink>,
        options: ExecutorOptions,
    ) -> PipelineResult<Self> {
        let setup = BackendSetup::from_session(&session)?;
        let layout = setup.layout;
        if source.layout() != layout {
            return Err(PipelineError::invalid_configuration(format!(
                "source delivers {} with {} streams, session expects {} with {}",
                source.layout().variant(),
                source.layout().num_streams(),
                layout.variant(),
                layout.num_streams()
            )));
        }
        let mut seen = HashSet::new();
        if let Some((name, _)) = sinks.iter().find(|(name, _)| !seen.insert(name.as_str())) {
            return Err(PipelineError::invalid_configuration(format!(
                "reader name '{}' is used twice",
                name
            )));
        }

        let stats = Arc::new(PipelineStats::default());
        let acq = &session.acquisition;
        let words_per_block = layout.words_per_block();
        let (word_writer, word_reader) = word_ring(
            WordRingConfig {
                capacity_words: acq.word_ring_blocks * words_per_block,
                max_burst_words: acq.max_burst_blocks * words_per_block,
                max_read_words: words_per_block,
                words_per_frame: layout.words_per_frame(),
            },
            Arc::clone(&stats),
        )?;
        let names: Vec<&str> = sinks.iter().map(|(name, _)| name.as_str()).collect();
        let (wave_writer, readers) = waveform_ring(&session, &names, Arc::clone(&stats))?;
        let reader_count = names.len();

        let backend = select_backend(options.backend, &setup)?;
        let backend_kind = backend.kind();
        let (tx, rx) = flume::unbounded();
        let source_exhausted = Arc::new(AtomicBool::new(false));
        let transformer = Transformer::new(
            &session,
            word_reader,
            backend,
            setup,
            wave_writer,
            rx,
            Arc::clone(&stats),
            Arc::clone(&source_exhausted),
        )?;
        let producer = Producer::new(
            source,
            word_writer,
            acq.max_burst_blocks,
            Arc::clone(&source_exhausted),
        );

        let mut executor = Self {
            stop: Arc::new(AtomicBool::new(false)),
            source_exhausted,
            workers: Vec::new(),
            control: EngineControl { tx },
            stats,
            backend: backend_kind,
        };

        let core_ids = if options.pin_threads {
            let ids = core_affinity::get_core_ids().unwrap_or_default();
            if ids.is_empty() {
                warn!("Could not get core IDs. Cannot set thread affinity.");
            }
            ids
        } else {
            Vec::new()
        };
        let realtime = |i: usize| Placement {
            core: core_ids.get(i % core_ids.len().max(1)).copied(),
            realtime: options.realtime_priority,
        };

        // Consumers first, so the producer never runs ahead of a missing reader.
        let frames_per_block = layout.frames_per_block();
        let spawned = readers
            .into_iter()
            .zip(sinks)
            .try_for_each(|(reader, (name, sink))| {
                let pump = ReaderPump::new(reader, sink, frames_per_block);
                executor.spawn(format!("pump-{}", name), Placement::default(), move |stop| {
                    pump.run(stop)
                })
            })
            .and_then(|()| {
                executor.spawn("transformer".to_string(), realtime(1), move |stop| {
                    transformer.run(stop)
                })
            })
            .and_then(|()| {
                executor.spawn("producer".to_string(), realtime(0), move |stop| {
                    producer.run(stop)
                })
            });
        if let Err(e) = spawned {
            if let Err(stop_err) = executor.stop() {
                warn!("Error while unwinding a failed start: {}", stop_err);
            }
            return Err(e);
        }

        info!(
            "Pipeline started: {} channels on the {} backend, {} readers",
            session.channels.len(),
            backend_kind,
            reader_count
        );
        Ok(executor)
    }

    fn spawn<F>(&mut self, name: String, placement: Placement, work: F) -> PipelineResult<()>
    where
        F: FnOnce(&AtomicBool) -> PipelineResult<()> + Send + 'static,
    {
        let stop = Arc::clone(&self.stop);
        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            placement.apply(&thread_name);
            debug!("Thread '{}' started", thread_name);
            let result = work(&stop);
            if let Err(e) = &result {
                error!("Thread '{}' failed: {}. Stopping pipeline.", thread_name, e);
                stop.store(true, Ordering::Relaxed);
            }
            debug!("Thread '{}' finished", thread_name);
            result
        })?;
        self.workers.push(Worker { name, handle });
        Ok(())
    }

    pub fn control(&self) -> EngineControl {
        self.control.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Backend the transformer started on.
    pub fn initial_backend(&self) -> BackendKind {
        self.backend
    }

    /// True once a finite source has delivered everything it holds.
    pub fn source_exhausted(&self) -> bool {
        self.source_exhausted.load(Ordering::Acquire)
    }

    /// True once every thread has returned. After a finite source this means the
    /// transformer has processed the last block and every reader has drained.
    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(|w| w.handle.is_finished())
    }

    /// True once a thread has failed and asked the others to stop.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn join_all(&mut self) -> PipelineResult<()> {
        self.stop.store(true, Ordering::Relaxed);
        let mut first_error = None;
        // Producer first, pumps last.
        while let Some(worker) = self.workers.pop() {
            debug!("Waiting for '{}' to shut down...", worker.name);
            let error = match worker.handle.join() {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!("Thread '{}' panicked: {}", worker.name, message);
                    PipelineError::ThreadFailed {
                        name: worker.name,
                        message,
                    }
                }
            };
            first_error.get_or_insert(error);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stops every thread and returns the first error any of them hit.
    ///
    /// Work that was reserved but not yet committed is discarded.
    pub fn stop(mut self) -> PipelineResult<()> {
        info!("Stopping pipeline threads...");
        let result = self.join_all();
        info!("Pipeline stopped: {:?}", self.stats.snapshot());
        result
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            if let Err(e) = self.join_all() {
                error!("Pipeline dropped with a failed thread: {}", e);
            }
        }
    }
}
