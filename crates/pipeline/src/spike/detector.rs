use neuro_types::{HoopDefinition, SpikeClass, MAX_HOOPS_PER_UNIT, MAX_UNITS};
use tracing::error;

use super::hoops::{self, HoopTable};
use crate::error::{BackendError, PipelineError, PipelineResult};

/// One threshold crossing found in a block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// Crossing sample relative to the first sample of the block. Negative when the
    /// crossing lies in the previous block's tail.
    pub offset: isize,
    pub class: SpikeClass,
}

/// Per-channel detector state.
///
/// The history buffer holds the last `pre + post` high-pass samples of the previous block
/// followed by the current block, so snippets can look back across the boundary. Scanning
/// stops `post` samples short of the end; the unscanned remainder and any skip left over
/// from a detection carry into the next block through `resume`.
#[derive(Debug)]
pub struct SpikeDetector {
    pre: usize,
    post: usize,
    threshold: f32,
    max_amplitude: f32,
    use_hoops: bool,
    hoops: HoopTable,
    history: Vec<f32>,
    resume: usize,
}

impl Clone for SpikeDetector {
    fn clone(&self) -> Self {
        Self {
            history: self.history.clone(),
            ..*self
        }
    }

    /// Reuses the history allocation.
    fn clone_from(&mut self, source: &Self) {
        self.pre = source.pre;
        self.post = source.post;
        self.threshold = source.threshold;
        self.max_amplitude = source.max_amplitude;
        self.use_hoops = source.use_hoops;
        self.hoops = source.hoops;
        self.history.clone_from(&source.history);
        self.resume = source.resume;
    }
}

impl SpikeDetector {
    pub fn new(
        pre: usize,
        post: usize,
        block_len: usize,
        threshold: f32,
        max_amplitude: f32,
    ) -> Self {
        let snippet_len = pre + post;
        Self {
            pre,
            post,
            threshold,
            max_amplitude,
            use_hoops: false,
            hoops: [[HoopDefinition::INACTIVE; MAX_HOOPS_PER_UNIT]; MAX_UNITS],
            history: vec![0.0; snippet_len + block_len],
            resume: snippet_len,
        }
    }

    pub fn snippet_len(&self) -> usize {
        self.pre + self.post
    }

    pub fn block_len(&self) -> usize {
        self.history.len() - self.snippet_len()
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn use_hoops(&self) -> bool {
        self.use_hoops
    }

    pub fn set_use_hoops(&mut self, enabled: bool) {
        self.use_hoops = enabled;
    }

    pub fn hoops(&self) -> &HoopTable {
        &self.hoops
    }

    /// Replaces one hoop. Out-of-range indices or times are rejected and nothing changes.
    pub fn set_hoop(
        &mut self,
        unit: usize,
        hoop: usize,
        definition: HoopDefinition,
    ) -> PipelineResult<()> {
        let len = self.snippet_len();
        if unit >= MAX_UNITS || hoop >= MAX_HOOPS_PER_UNIT {
            error!("Rejected hoop edit: unit {} hoop {} out of range", unit, hoop);
            return Err(PipelineError::invalid_parameter(format!(
                "hoop ({}, {}) outside {}x{} table",
                unit, hoop, MAX_UNITS, MAX_HOOPS_PER_UNIT
            )));
        }
        if definition.t_a as usize >= len || definition.t_b as usize >= len {
            error!(
                "Rejected hoop edit: times {}..{} outside {}-sample snippet",
                definition.t_a, definition.t_b, len
            );
            return Err(PipelineError::invalid_parameter(format!(
                "hoop times {}..{} outside snippet of {} samples",
                definition.t_a, definition.t_b, len
            )));
        }
        self.hoops[unit][hoop] = definition;
        Ok(())
    }

    /// Copies threshold, hoops and the hoop flag from `other`.
    pub fn copy_settings_from(&mut self, other: &SpikeDetector) {
        self.threshold = other.threshold;
        self.use_hoops = other.use_hoops;
        if self.snippet_len() == other.snippet_len() {
            self.hoops = other.hoops;
        }
    }

    #[inline]
    fn crosses(&self, v: f32) -> bool {
        if self.threshold < 0.0 {
            v < self.threshold
        } else {
            v > self.threshold
        }
    }

    /// Scans one block of high-pass samples (microvolts) and reports each crossing once.
    /// Blocks longer than the configured block length are rejected untouched.
    pub fn detect(&mut self, high: &[f32], mut emit: impl FnMut(Detection)) -> PipelineResult<()> {
        let len = self.snippet_len();
        let n = high.len();
        if n > self.block_len() {
            error!("Detector got {} samples, block length is {}", n, self.block_len());
            return Err(BackendError::BlockSize {
                expected: self.block_len(),
                got: n,
            }
            .into());
        }
        self.history[len..len + n].copy_from_slice(high);

        let end = len + n - self.post;
        let mut j = self.resume;
        while j < end {
            if self.crosses(self.history[j]) {
                let start = j - self.pre;
                let snippet = &self.history[start..start + len];
                let class = hoops::classify(snippet, self.max_amplitude, self.use_hoops, &self.hoops);
                emit(Detection {
                    offset: j as isize - len as isize,
                    class,
                });
                j += len;
            } else {
                j += 1;
            }
        }

        self.resume = j.saturating_sub(n).max(self.pre);
        self.history.copy_within(n..n + len, 0);
        Ok(())
    }

    /// Forgets history and any pending skip.
    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|v| *v = 0.0);
        self.resume = self.snippet_len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const PRE: usize = 6;
    const POST: usize = 10;

    /// Runs `signal` through blocks of `block` samples and returns absolute crossing indices.
    fn run(detector: &mut SpikeDetector, signal: &[f32], block: usize) -> Vec<(i64, SpikeClass)> {
        let mut found = Vec::new();
        for (k, chunk) in signal.chunks(block).enumerate() {
            let base = (k * block) as i64;
            detector
                .detect(chunk, |d| found.push((base + d.offset as i64, d.class)))
                .unwrap();
        }
        found
    }

    fn spike_at(len: usize, positions: &[usize]) -> Vec<f32> {
        let mut signal = vec![0.0f32; len];
        for &p in positions {
            signal[p] = -120.0;
            signal[p + 1] = -80.0;
            signal[p + 2] = 40.0;
        }
        signal
    }

    #[test]
    fn finds_crossings_in_one_block() {
        let mut det = SpikeDetector::new(PRE, POST, 200, -70.0, 1000.0);
        let signal = spike_at(200, &[20, 100]);
        let found = run(&mut det, &signal, 200);
        assert_eq!(
            found,
            vec![(20, SpikeClass::Unclassified), (100, SpikeClass::Unclassified)]
        );
    }

    #[test]
    fn positive_threshold_looks_for_upward_crossings() {
        let mut det = SpikeDetector::new(PRE, POST, 100, 30.0, 1000.0);
        let signal = spike_at(100, &[40]);
        assert_eq!(run(&mut det, &signal, 100), vec![(42, SpikeClass::Unclassified)]);
    }

    #[test]
    fn detection_skips_one_snippet() {
        let mut det = SpikeDetector::new(PRE, POST, 100, -70.0, 1000.0);
        // Second spike inside the first one's snippet window is not reported.
        let signal = spike_at(100, &[30, 38, 60]);
        let found: Vec<i64> = run(&mut det, &signal, 100).into_iter().map(|f| f.0).collect();
        assert_eq!(found, vec![30, 60]);
    }

    #[test]
    fn crossing_near_block_end_is_carried_over() {
        let mut det = SpikeDetector::new(PRE, POST, 50, -70.0, 1000.0);
        let signal = spike_at(150, &[45]);
        let mut offsets = Vec::new();
        for chunk in signal.chunks(50) {
            det.detect(chunk, |d| offsets.push(d.offset)).unwrap();
        }
        // Found in the second block, looking back into the first.
        assert_eq!(offsets, vec![-5]);
    }

    #[test]
    fn boundary_crossings_are_reported_once() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let block = rng.gen_range(20..80);
            let position = rng.gen_range(PRE + 1..400 - POST - 3);
            let mut det = SpikeDetector::new(PRE, POST, block, -70.0, 1000.0);
            let signal = spike_at(400, &[position]);
            let found = run(&mut det, &signal, block);
            assert_eq!(found, vec![(position as i64, SpikeClass::Unclassified)], "block {}", block);
        }
    }

    #[test]
    fn oversized_snippets_are_artifacts() {
        let mut det = SpikeDetector::new(PRE, POST, 100, -70.0, 100.0);
        let signal = spike_at(100, &[50]);
        assert_eq!(run(&mut det, &signal, 100), vec![(50, SpikeClass::Artifact)]);
    }

    #[test]
    fn hoops_classify_units() {
        let mut det = SpikeDetector::new(PRE, POST, 100, -70.0, 1000.0);
        // The crossing sits at snippet index PRE; require it below -100 uV.
        det.set_hoop(2, 0, HoopDefinition::new(PRE as u16, -200.0, PRE as u16, -100.0))
            .unwrap();
        det.set_use_hoops(true);
        let signal = spike_at(100, &[50]);
        assert_eq!(run(&mut det, &signal, 100), vec![(50, SpikeClass::Unit(2))]);
    }

    #[test]
    fn invalid_hoop_edits_leave_state_untouched() {
        let mut det = SpikeDetector::new(PRE, POST, 100, -70.0, 1000.0);
        let hoop = HoopDefinition::new(1, -10.0, 2, 10.0);
        assert!(det.set_hoop(MAX_UNITS, 0, hoop).is_err());
        assert!(det.set_hoop(0, MAX_HOOPS_PER_UNIT, hoop).is_err());
        assert!(det
            .set_hoop(0, 0, HoopDefinition::new(0, -10.0, (PRE + POST) as u16, 10.0))
            .is_err());
        assert!(det.hoops().iter().flatten().all(|h| !h.is_active()));
    }

    #[test]
    fn oversized_block_is_rejected_without_scanning() {
        let mut det = SpikeDetector::new(PRE, POST, 50, -70.0, 1000.0);
        let signal = spike_at(60, &[20]);
        let mut found = 0;
        let err = det.detect(&signal, |_| found += 1).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Backend(BackendError::BlockSize { expected: 50, got: 60 })
        ));
        assert_eq!(found, 0);
        // The detector is still usable with a proper block.
        assert_eq!(run(&mut det, &signal[..50], 50), vec![(20, SpikeClass::Unclassified)]);
    }
}
