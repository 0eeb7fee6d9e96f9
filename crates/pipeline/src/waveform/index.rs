/// Maps absolute sample positions onto ring slots.
///
/// Storage is `capacity + overhang` long. A write burst always lands contiguously from
/// its start slot, spilling into the overhang when it crosses `capacity`; commit copies
/// the spilled part back to slot 0 so readers only ever see slots below `capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingIndex {
    capacity: usize,
    overhang: usize,
}

impl RingIndex {
    pub fn new(capacity: usize, overhang: usize) -> Self {
        Self { capacity, overhang }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn storage_len(&self) -> usize {
        self.capacity + self.overhang
    }

    #[inline]
    pub fn slot(&self, absolute: u64) -> usize {
        (absolute % self.capacity as u64) as usize
    }

    /// Slot for sample `t` of a burst starting at `start`; may fall in the overhang.
    #[inline]
    pub fn burst_slot(&self, start: u64, t: usize) -> usize {
        self.slot(start) + t
    }

    /// Overhang range written by a burst of `n` at `start`. It belongs at slot 0 onward.
    pub fn spill(&self, start: u64, n: usize) -> Option<std::ops::Range<usize>> {
        let end = self.slot(start) + n;
        (end > self.capacity).then(|| self.capacity..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spill_only_past_capacity() {
        let idx = RingIndex::new(100, 10);
        assert_eq!(idx.storage_len(), 110);
        assert_eq!(idx.slot(250), 50);
        assert_eq!(idx.spill(90, 10), None);
        assert_eq!(idx.spill(95, 10), Some(100..105));
        assert_eq!(idx.burst_slot(195, 7), 102);
    }
}
