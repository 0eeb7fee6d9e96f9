//! Lock-free ring of raw 16-bit words between the producer and the transformer.
//!
//! The producer side writes little-endian wire bytes as native words; the consumer side
//! peeks at a contiguous run of words and releases them once the block is processed.
//! Exactly one thread owns each half.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, error};

use crate::allocator;
use crate::error::{PipelineError, PipelineResult, WordRingError};
use crate::stats::PipelineStats;

/// Sizing for a word ring.
#[derive(Debug, Clone, Copy)]
pub struct WordRingConfig {
    pub capacity_words: usize,
    /// Largest burst the producer writes at once.
    pub max_burst_words: usize,
    /// Largest run the consumer peeks at once.
    pub max_read_words: usize,
    pub words_per_frame: usize,
}

/// Creates the two halves of a word ring.
pub fn word_ring(
    config: WordRingConfig,
    stats: Arc<PipelineStats>,
) -> PipelineResult<(WordWriter, WordReader)> {
    if config.capacity_words <= config.max_burst_words + config.words_per_frame {
        return Err(PipelineError::invalid_configuration(format!(
            "word ring of {} words cannot hold a {}-word burst plus a {}-word frame",
            config.capacity_words, config.max_burst_words, config.words_per_frame
        )));
    }
    if config.max_read_words > config.capacity_words {
        return Err(PipelineError::invalid_configuration(format!(
            "read size {} exceeds ring capacity {}",
            config.max_read_words, config.capacity_words
        )));
    }
    let staging = allocator::filled(config.max_read_words, 0u16, "word ring staging")?;
    let (producer, consumer) = RingBuffer::new(config.capacity_words);
    debug!(
        "Word ring created: {} words, burst {}, read {}",
        config.capacity_words, config.max_burst_words, config.max_read_words
    );
    Ok((
        WordWriter {
            producer,
            capacity: config.capacity_words,
            stats,
        },
        WordReader { consumer, staging },
    ))
}

/// Producer half.
pub struct WordWriter {
    producer: Producer<u16>,
    capacity: usize,
    stats: Arc<PipelineStats>,
}

impl WordWriter {
    pub fn free_words(&self) -> usize {
        self.producer.slots()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Checks that `n` words fit. Never blocks; a shortfall is an overrun.
    pub fn reserve_write(&self, n: usize) -> Result<(), WordRingError> {
        let free = self.producer.slots();
        if free < n {
            PipelineStats::add(&self.stats.overruns, 1);
            error!(
                "Word ring overrun: {} words requested, {} free. Data is being lost.",
                n, free
            );
            return Err(WordRingError::Overrun { requested: n, free });
        }
        Ok(())
    }

    /// Converts `n` little-endian words from `bytes` into the ring.
    pub fn write(&mut self, bytes: &[u8], n: usize) -> Result<(), WordRingError> {
        if bytes.len() < n * 2 {
            return Err(WordRingError::ShortInput {
                bytes: bytes.len(),
                words: n,
            });
        }
        self.reserve_write(n)?;
        let free = self.producer.slots();
        let mut chunk = self
            .producer
            .write_chunk(n)
            .map_err(|_| WordRingError::Overrun { requested: n, free })?;
        let (first, second) = chunk.as_mut_slices();
        let split = first.len() * 2;
        LittleEndian::read_u16_into(&bytes[..split], first);
        LittleEndian::read_u16_into(&bytes[split..n * 2], second);
        chunk.commit_all();
        PipelineStats::add(&self.stats.words_produced, n as u64);
        Ok(())
    }
}

/// Consumer half.
pub struct WordReader {
    consumer: Consumer<u16>,
    staging: Vec<u16>,
}

impl WordReader {
    pub fn available(&self) -> usize {
        self.consumer.slots()
    }

    pub fn max_read(&self) -> usize {
        self.staging.len()
    }

    /// Returns the next `n` words as one contiguous slice without consuming them,
    /// or `None` if fewer than `n` are buffered.
    pub fn try_pointer_read(&mut self, n: usize) -> Result<Option<&[u16]>, WordRingError> {
        if n > self.staging.len() {
            return Err(WordRingError::ReadTooLarge {
                requested: n,
                max: self.staging.len(),
            });
        }
        let Ok(chunk) = self.consumer.read_chunk(n) else {
            return Ok(None);
        };
        let (first, second) = chunk.as_slices();
        self.staging[..first.len()].copy_from_slice(first);
        self.staging[first.len()..n].copy_from_slice(second);
        // Dropping the chunk uncommitted leaves the words in the ring until `release`.
        drop(chunk);
        Ok(Some(&self.staging[..n]))
    }

    /// Frees the oldest `n` words.
    pub fn release(&mut self, n: usize) -> Result<(), WordRingError> {
        let available = self.consumer.slots();
        let chunk = self
            .consumer
            .read_chunk(n)
            .map_err(|_| WordRingError::Underrun {
                requested: n,
                available,
            })?;
        chunk.commit_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ring(capacity: usize, max_read: usize) -> (WordWriter, WordReader, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::default());
        let (w, r) = word_ring(
            WordRingConfig {
                capacity_words: capacity,
                max_burst_words: max_read,
                max_read_words: max_read,
                words_per_frame: 4,
            },
            Arc::clone(&stats),
        )
        .unwrap();
        (w, r, stats)
    }

    fn le_bytes(words: &[u16]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn pointer_read_spans_the_wrap() {
        let (mut w, mut r, _) = ring(16, 8);
        w.write(&le_bytes(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]), 10).unwrap();
        r.release(10).unwrap();

        let words: Vec<u16> = (100..108).collect();
        w.write(&le_bytes(&words), 8).unwrap();
        assert_eq!(r.try_pointer_read(8).unwrap().unwrap(), &words[..]);
        // Peeking does not consume.
        assert_eq!(r.available(), 8);
        r.release(8).unwrap();
        assert_eq!(r.available(), 0);
    }

    #[test]
    fn overrun_fails_fast_and_counts() {
        let (mut w, _r, stats) = ring(16, 8);
        w.write(&le_bytes(&[0; 8]), 8).unwrap();
        w.write(&le_bytes(&[0; 8]), 8).unwrap();
        let err = w.write(&le_bytes(&[0; 8]), 8).unwrap_err();
        assert_eq!(err, WordRingError::Overrun { requested: 8, free: 0 });
        assert_eq!(stats.snapshot().overruns, 1);
    }

    #[test]
    fn underrun_is_not_an_error() {
        let (mut w, mut r, _) = ring(16, 8);
        w.write(&le_bytes(&[1, 2, 3]), 3).unwrap();
        assert!(r.try_pointer_read(4).unwrap().is_none());
        assert!(matches!(
            r.try_pointer_read(9),
            Err(WordRingError::ReadTooLarge { requested: 9, max: 8 })
        ));
        assert!(matches!(r.release(4), Err(WordRingError::Underrun { .. })));
    }

    #[test]
    fn undersized_ring_is_rejected() {
        let stats = Arc::new(PipelineStats::default());
        let result = word_ring(
            WordRingConfig {
                capacity_words: 100,
                max_burst_words: 96,
                max_read_words: 50,
                words_per_frame: 4,
            },
            stats,
        );
        assert!(matches!(
            result,
            Err(PipelineError::InvalidConfiguration { .. })
        ));
    }

    proptest! {
        #[test]
        fn free_plus_used_is_capacity(ops in proptest::collection::vec((any::<bool>(), 1usize..=8), 1..200)) {
            let (mut w, mut r, _) = ring(32, 8);
            let mut next: u16 = 0;
            let mut expected = std::collections::VecDeque::new();
            for (is_write, n) in ops {
                if is_write {
                    let words: Vec<u16> = (0..n).map(|i| next.wrapping_add(i as u16)).collect();
                    if w.write(&le_bytes(&words), n).is_ok() {
                        next = next.wrapping_add(n as u16);
                        expected.extend(words);
                    }
                } else if let Some(words) = r.try_pointer_read(n).unwrap() {
                    let want: Vec<u16> = expected.iter().take(n).copied().collect();
                    prop_assert_eq!(words, &want[..]);
                    r.release(n).unwrap();
                    expected.drain(..n);
                }
                prop_assert_eq!(w.free_words() + r.available(), w.capacity());
                prop_assert_eq!(r.available(), expected.len());
            }
        }
    }
}
