use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};

use super::{RingAccounting, Shared, WaveformCatalog, WaveformId};
use crate::error::WaveformError;
use crate::stats::PipelineStats;
use crate::sync::POLL_INTERVAL;

/// The single writing half of the waveform ring.
pub struct WaveformWriter {
    shared: Arc<Shared>,
    /// Absolute start and length of the open reservation.
    reservation: Option<(u64, usize)>,
}

impl WaveformWriter {
    pub(super) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            reservation: None,
        }
    }

    pub fn catalog(&self) -> &WaveformCatalog {
        &self.shared.catalog
    }

    pub fn max_write(&self) -> usize {
        self.shared.geometry.max_write
    }

    pub fn percent_full(&self) -> f32 {
        self.shared.percent_full()
    }

    pub fn accounting(&self) -> RingAccounting {
        self.shared.accounting()
    }

    fn check_reserve(&self, n: usize) -> Result<(), WaveformError> {
        if self.reservation.is_some() {
            return Err(WaveformError::ReservationOpen("write"));
        }
        let max = self.shared.geometry.max_write;
        if n > max {
            return Err(WaveformError::WriteTooLarge { requested: n, max });
        }
        Ok(())
    }

    fn open(&mut self, n: usize) {
        let mut cursors = self.shared.cursors();
        cursors.reserved_write = n;
        self.reservation = Some((cursors.committed, n));
        drop(cursors);
        if self.shared.stalled.swap(false, Ordering::Relaxed) {
            info!("Waveform ring writer resumed");
        }
    }

    /// Logs once per stall episode.
    fn note_stall(&self) {
        if !self.shared.stalled.swap(true, Ordering::Relaxed) {
            PipelineStats::add(&self.shared.stats.backpressure_events, 1);
            error!(
                "Waveform reader '{}' is not keeping up: ring {:.0}% full, writer stalled",
                self.shared.slowest_reader(),
                self.shared.percent_full()
            );
        }
    }

    /// Reserves `n` slots if they are free right now.
    pub fn try_reserve_write(&mut self, n: usize) -> Result<bool, WaveformError> {
        self.check_reserve(n)?;
        if self.shared.free.try_acquire(n) {
            self.open(n);
            Ok(true)
        } else {
            self.note_stall();
            Ok(false)
        }
    }

    /// Waits for `n` free slots. Returns `false` if `stop` is raised first.
    pub fn reserve_write(&mut self, n: usize, stop: &AtomicBool) -> Result<bool, WaveformError> {
        self.check_reserve(n)?;
        while !stop.load(Ordering::Relaxed) {
            if self.shared.free.acquire_timeout(n, POLL_INTERVAL) {
                self.open(n);
                return Ok(true);
            }
            self.note_stall();
        }
        Ok(false)
    }

    fn slot(&self, t: usize) -> Result<usize, WaveformError> {
        let (start, n) = self.reservation.ok_or(WaveformError::NoReservation("write"))?;
        if t >= n {
            return Err(WaveformError::OutOfRange {
                t: t as isize,
                min: 0,
                max: n as isize,
            });
        }
        Ok(self.shared.index.burst_slot(start, t))
    }

    pub fn set(&mut self, id: WaveformId, t: usize, value: u16) -> Result<(), WaveformError> {
        let slot = self.slot(t)?;
        self.shared.data[id.0][slot].store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Writes `values` starting at sample 0 of the reservation.
    pub fn write(&mut self, id: WaveformId, values: &[u16]) -> Result<(), WaveformError> {
        if values.is_empty() {
            return Ok(());
        }
        let first = self.slot(0)?;
        self.slot(values.len() - 1)?;
        let storage = &self.shared.data[id.0][first..first + values.len()];
        for (cell, &v) in storage.iter().zip(values) {
            cell.store(v, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn set_timestamp(&mut self, t: usize, timestamp: u32) -> Result<(), WaveformError> {
        let slot = self.slot(t)?;
        self.shared.timestamps[slot].store(timestamp, Ordering::Relaxed);
        Ok(())
    }

    /// Publishes the reservation to every reader.
    pub fn commit(&mut self) -> Result<(), WaveformError> {
        let (start, n) = self
            .reservation
            .take()
            .ok_or(WaveformError::NoReservation("write"))?;
        let shared = &self.shared;
        if let Some(spill) = shared.index.spill(start, n) {
            let len = spill.len();
            for storage in &shared.data {
                for (dst, src) in (0..len).zip(spill.clone()) {
                    storage[dst].store(storage[src].load(Ordering::Relaxed), Ordering::Relaxed);
                }
            }
            for (dst, src) in (0..len).zip(spill) {
                let ts = shared.timestamps[src].load(Ordering::Relaxed);
                shared.timestamps[dst].store(ts, Ordering::Relaxed);
            }
        }

        let mut cursors = shared.cursors();
        cursors.committed += n as u64;
        cursors.reserved_write = 0;
        for (reader, pos) in shared.readers.iter().zip(&cursors.released) {
            if pos.is_some() {
                reader.unread.release(n);
            }
        }
        Ok(())
    }
}

impl Drop for WaveformWriter {
    fn drop(&mut self) {
        if let Some((_, n)) = self.reservation {
            info!("Waveform writer dropped with {} uncommitted samples", n);
        }
        self.shared.finished.store(true, Ordering::Release);
        info!("Waveform writer finished after {} samples", self.shared.cursors().committed);
    }
}
