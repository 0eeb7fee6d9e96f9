//! Published waveform ring: one writer, any number of named readers.
//!
//! Every waveform of the session shares one set of absolute counters. The writer
//! reserves free slots, fills them and commits, which hands the new samples to every
//! reader. Each reader reserves, reads (reaching back up to the configured memory into
//! samples it already released) and releases. Slots return to the free pool only when
//! the slowest reader has released them, and `memory` slots are always held back so
//! look-back data is never overwritten.
//!
//! Accounting, for every reader `r`:
//! `free + reserved_write + unread(r) + lead(r) + memory == capacity`, where `lead(r)`
//! is how far `r` has read beyond the slowest reader.

mod catalog;
mod index;
mod reader;
mod writer;

pub use catalog::{WaveformCatalog, WaveformId};
pub use index::RingIndex;
pub use reader::WaveformReader;
pub use writer::WaveformWriter;

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use neuro_types::SessionContext;
use serde::Serialize;
use tracing::{debug, info};

use crate::allocator;
use crate::error::{PipelineError, PipelineResult};
use crate::stats::PipelineStats;
use crate::sync::CountingSemaphore;

/// Ring sizes in samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    pub capacity: usize,
    pub memory: usize,
    pub drain_margin: usize,
    pub max_write: usize,
}

impl RingGeometry {
    pub fn from_session(session: &SessionContext) -> Self {
        let block = session.frames_per_block();
        let ring = &session.ring;
        Self {
            capacity: ring.capacity_blocks * block,
            memory: ring.memory_blocks * block,
            drain_margin: ring.drain_margin_blocks * block,
            max_write: ring.max_write_blocks * block,
        }
    }

    fn validate(&self) -> PipelineResult<()> {
        if self.max_write == 0 || self.memory + self.max_write + self.drain_margin >= self.capacity {
            return Err(PipelineError::invalid_configuration(format!(
                "waveform ring of {} samples cannot hold memory {} + burst {} + margin {}",
                self.capacity, self.memory, self.max_write, self.drain_margin
            )));
        }
        Ok(())
    }
}

/// Snapshot of the ring's slot accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RingAccounting {
    pub capacity: usize,
    pub memory: usize,
    pub free: usize,
    pub reserved_write: usize,
    pub committed: u64,
    /// Released position of each attached reader.
    pub readers: Vec<Option<u64>>,
}

impl RingAccounting {
    /// Slots pinned by the slowest attached reader's unread data.
    pub fn unread_by_slowest(&self) -> usize {
        let floor = self.readers.iter().flatten().min().copied().unwrap_or(self.committed);
        (self.committed - floor) as usize
    }
}

#[derive(Debug)]
struct Cursors {
    committed: u64,
    reserved_write: usize,
    /// `None` once the reader is dropped.
    released: Vec<Option<u64>>,
}

impl Cursors {
    /// Position every attached reader has released; the writer's position when none remain.
    fn floor(&self) -> u64 {
        self.released
            .iter()
            .flatten()
            .min()
            .copied()
            .unwrap_or(self.committed)
    }
}

struct ReaderSlot {
    name: String,
    unread: CountingSemaphore,
}

pub(crate) struct Shared {
    catalog: WaveformCatalog,
    geometry: RingGeometry,
    index: RingIndex,
    data: Vec<Box<[AtomicU16]>>,
    timestamps: Box<[AtomicU32]>,
    free: CountingSemaphore,
    cursors: Mutex<Cursors>,
    readers: Vec<ReaderSlot>,
    stalled: AtomicBool,
    /// Set once the writer is dropped; nothing more will be committed.
    finished: AtomicBool,
    stats: Arc<PipelineStats>,
}

impl Shared {
    fn cursors(&self) -> MutexGuard<'_, Cursors> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slowest_reader(&self) -> &str {
        let cursors = self.cursors();
        cursors
            .released
            .iter()
            .enumerate()
            .filter_map(|(i, pos)| pos.map(|p| (p, i)))
            .min()
            .map_or("<none>", |(_, i)| self.readers[i].name.as_str())
    }

    fn percent_full(&self) -> f32 {
        let usable = self.geometry.capacity - self.geometry.memory;
        let used = usable.saturating_sub(self.free.available());
        used as f32 * 100.0 / usable as f32
    }

    fn accounting(&self) -> RingAccounting {
        let cursors = self.cursors();
        RingAccounting {
            capacity: self.geometry.capacity,
            memory: self.geometry.memory,
            free: self.free.available(),
            reserved_write: cursors.reserved_write,
            committed: cursors.committed,
            readers: cursors.released.clone(),
        }
    }
}

/// Builds the ring for `session` and hands out the writer plus one reader per name.
pub fn waveform_ring(
    session: &SessionContext,
    reader_names: &[&str],
    stats: Arc<PipelineStats>,
) -> PipelineResult<(WaveformWriter, Vec<WaveformReader>)> {
    let geometry = RingGeometry::from_session(session);
    geometry.validate()?;
    let catalog = WaveformCatalog::new(session);
    let index = RingIndex::new(geometry.capacity, geometry.max_write);

    let data = (0..catalog.len())
        .map(|_| allocator::boxed_with(index.storage_len(), "waveform storage", || AtomicU16::new(0)))
        .collect::<PipelineResult<Vec<_>>>()?;
    let timestamps =
        allocator::boxed_with(index.storage_len(), "timestamp storage", || AtomicU32::new(0))?;

    let shared = Arc::new(Shared {
        geometry,
        index,
        data,
        timestamps,
        free: CountingSemaphore::new(geometry.capacity - geometry.memory),
        cursors: Mutex::new(Cursors {
            committed: 0,
            reserved_write: 0,
            released: vec![Some(0); reader_names.len()],
        }),
        readers: reader_names
            .iter()
            .map(|name| ReaderSlot {
                name: (*name).to_string(),
                unread: CountingSemaphore::new(0),
            })
            .collect(),
        stalled: AtomicBool::new(false),
        finished: AtomicBool::new(false),
        stats,
        catalog,
    });
    info!(
        "Waveform ring: {} waveforms x {} samples (memory {}, burst {}), readers {:?}",
        shared.catalog.len(),
        geometry.capacity,
        geometry.memory,
        geometry.max_write,
        reader_names
    );
    debug!(
        "Waveform ring storage: {} bytes",
        shared.catalog.len() * index.storage_len() * 2 + index.storage_len() * 4
    );

    let readers = (0..reader_names.len())
        .map(|id| WaveformReader::new(Arc::clone(&shared), id))
        .collect();
    Ok((WaveformWriter::new(shared), readers))
}
