use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use neuro_sensor::units;
use neuro_types::SpikeClass;
use tracing::debug;

use super::{Shared, WaveformCatalog, WaveformId};
use crate::error::WaveformError;
use crate::sync::POLL_INTERVAL;

/// One named consumer of the waveform ring.
///
/// Time indices are relative to the start of the current reservation: `0..reserved` is
/// new data, `-memory_depth()..0` is history this reader already released.
pub struct WaveformReader {
    shared: Arc<Shared>,
    id: usize,
    /// Absolute position of sample 0.
    position: u64,
    reserved: Option<usize>,
}

impl WaveformReader {
    pub(super) fn new(shared: Arc<Shared>, id: usize) -> Self {
        Self {
            shared,
            id,
            position: 0,
            reserved: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.readers[self.id].name
    }

    pub fn catalog(&self) -> &WaveformCatalog {
        &self.shared.catalog
    }

    /// Absolute sample position of time index 0.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Committed samples not yet reserved by this reader.
    pub fn available(&self) -> usize {
        self.shared.readers[self.id].unread.available()
    }

    pub fn memory_depth(&self) -> usize {
        (self.position.min(self.shared.geometry.memory as u64)) as usize
    }

    pub fn memory_capacity(&self) -> usize {
        self.shared.geometry.memory
    }

    pub fn reserved(&self) -> usize {
        self.reserved.unwrap_or(0)
    }

    pub fn percent_full(&self) -> f32 {
        self.shared.percent_full()
    }

    /// True once the writer is gone. The drain margin no longer applies after that.
    pub fn writer_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    fn margin(&self) -> usize {
        if self.writer_finished() {
            0
        } else {
            self.shared.geometry.drain_margin
        }
    }

    fn check_reserve(&self, n: usize) -> Result<(), WaveformError> {
        if self.reserved.is_some() {
            return Err(WaveformError::ReservationOpen("read"));
        }
        let g = &self.shared.geometry;
        let limit = g.capacity - g.memory - g.drain_margin;
        if n > limit {
            return Err(WaveformError::ReadTooLarge {
                requested: n,
                limit,
            });
        }
        Ok(())
    }

    /// Reserves `n` samples if `n` plus the drain margin have been committed. Once the
    /// writer has finished, `n` committed samples are enough.
    pub fn reserve_read(&mut self, n: usize) -> Result<bool, WaveformError> {
        self.check_reserve(n)?;
        let needed = n + self.margin();
        let unread = &self.shared.readers[self.id].unread;
        // Only this reader acquires from its own count, so the check cannot go stale.
        if unread.available() >= needed && unread.try_acquire(n) {
            self.reserved = Some(n);
            return Ok(true);
        }
        Ok(false)
    }

    /// Waits for a read reservation of `n`. Returns `false` if `stop` is raised first, or
    /// if the writer has finished with fewer than `n` samples left unread.
    pub fn reserve_read_until(&mut self, n: usize, stop: &AtomicBool) -> Result<bool, WaveformError> {
        self.check_reserve(n)?;
        let needed = n + self.shared.geometry.drain_margin;
        let unread = &self.shared.readers[self.id].unread;
        while !stop.load(Ordering::Relaxed) {
            if self.writer_finished() {
                if !unread.try_acquire(n) {
                    return Ok(false);
                }
                self.reserved = Some(n);
                return Ok(true);
            }
            if unread.acquire_timeout(needed, POLL_INTERVAL) {
                unread.release(needed - n);
                self.reserved = Some(n);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn slot(&self, t: isize) -> Result<usize, WaveformError> {
        let reserved = self.reserved.ok_or(WaveformError::NoReservation("read"))? as isize;
        let min = -(self.memory_depth() as isize);
        if t < min || t >= reserved {
            return Err(WaveformError::OutOfRange {
                t,
                min,
                max: reserved,
            });
        }
        let absolute = (self.position as i64 + t as i64) as u64;
        Ok(self.shared.index.slot(absolute))
    }

    /// Raw 16-bit code of waveform `id` at time index `t`.
    pub fn get(&self, id: WaveformId, t: isize) -> Result<u16, WaveformError> {
        let slot = self.slot(t)?;
        Ok(self.shared.data[id.0][slot].load(Ordering::Relaxed))
    }

    /// Copies `out.len()` samples starting at `t` into `out`.
    pub fn read_into(&self, id: WaveformId, t: isize, out: &mut [u16]) -> Result<(), WaveformError> {
        for (i, v) in out.iter_mut().enumerate() {
            *v = self.get(id, t + i as isize)?;
        }
        Ok(())
    }

    pub fn timestamp(&self, t: isize) -> Result<u32, WaveformError> {
        let slot = self.slot(t)?;
        Ok(self.shared.timestamps[slot].load(Ordering::Relaxed))
    }

    pub fn amplifier_microvolts(&self, id: WaveformId, t: isize) -> Result<f32, WaveformError> {
        Ok(units::amplifier_microvolts(self.get(id, t)?))
    }

    pub fn analog_in_volts(&self, id: WaveformId, t: isize) -> Result<f32, WaveformError> {
        Ok(units::adc_volts(self.shared.catalog.variant(), self.get(id, t)?))
    }

    pub fn digital_line(&self, id: WaveformId, t: isize, line: usize) -> Result<bool, WaveformError> {
        Ok(line < 16 && self.get(id, t)? >> line & 1 == 1)
    }

    pub fn spike_class(&self, id: WaveformId, t: isize) -> Result<SpikeClass, WaveformError> {
        let code = self.get(id, t)?;
        Ok(u8::try_from(code)
            .ok()
            .and_then(SpikeClass::from_code)
            .unwrap_or(SpikeClass::NoSpike))
    }

    /// Ends the reservation. Slots go back to the free pool once every reader is past them.
    pub fn release(&mut self) -> Result<(), WaveformError> {
        let n = self
            .reserved
            .take()
            .ok_or(WaveformError::NoReservation("read"))?;
        self.position += n as u64;
        let mut cursors = self.shared.cursors();
        let before = cursors.floor();
        cursors.released[self.id] = Some(self.position);
        let after = cursors.floor();
        self.shared.free.release((after - before) as usize);
        Ok(())
    }
}

impl Drop for WaveformReader {
    fn drop(&mut self) {
        let mut cursors = self.shared.cursors();
        let before = cursors.floor();
        cursors.released[self.id] = None;
        let after = cursors.floor();
        self.shared.free.release((after - before) as usize);
        debug!("Waveform reader '{}' detached", self.shared.readers[self.id].name);
    }
}
