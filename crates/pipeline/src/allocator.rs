//! Fallible buffer allocation.
//!
//! Ring storage and backend buffers are sized from configuration and can be large,
//! so allocation failures are reported as `PipelineError::Allocation` instead of aborting.

use std::mem::size_of;

use crate::error::{PipelineError, PipelineResult};

fn reserve<T>(len: usize, what: &'static str) -> PipelineResult<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| PipelineError::Allocation {
            what,
            bytes: len.saturating_mul(size_of::<T>()),
        })?;
    Ok(buf)
}

/// An empty vector with room for `len` elements.
pub fn with_capacity<T>(len: usize, what: &'static str) -> PipelineResult<Vec<T>> {
    reserve(len, what)
}

/// A vector of `len` copies of `value`.
pub fn filled<T: Clone>(len: usize, value: T, what: &'static str) -> PipelineResult<Vec<T>> {
    let mut buf = reserve(len, what)?;
    buf.resize(len, value);
    Ok(buf)
}

/// A boxed slice built element by element, for types that are not `Clone` such as atomics.
pub fn boxed_with<T>(
    len: usize,
    what: &'static str,
    mut make: impl FnMut() -> T,
) -> PipelineResult<Box<[T]>> {
    let mut buf = reserve(len, what)?;
    buf.extend((0..len).map(|_| make()));
    Ok(buf.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU16;

    #[test]
    fn absurd_sizes_report_allocation_errors() {
        let err = filled(usize::MAX / 2, 0u16, "test buffer").unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Allocation {
                what: "test buffer",
                ..
            }
        ));
    }

    #[test]
    fn builds_atomic_storage() {
        let storage = boxed_with(5, "atomics", || AtomicU16::new(7)).unwrap();
        assert_eq!(storage.len(), 5);
        assert_eq!(storage[4].load(std::sync::atomic::Ordering::Relaxed), 7);
    }
}
