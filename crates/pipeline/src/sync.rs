//! Counting semaphore used for ring accounting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How long a blocked thread waits before rechecking its stop flag.
pub const POLL_INTERVAL: Duration = Duration::from_micros(100);

#[derive(Debug, Default)]
pub struct CountingSemaphore {
    count: Mutex<usize>,
    changed: Condvar,
}

impl CountingSemaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn available(&self) -> usize {
        *self.lock()
    }

    pub fn try_acquire(&self, n: usize) -> bool {
        let mut count = self.lock();
        if *count >= n {
            *count -= n;
            true
        } else {
            false
        }
    }

    /// Takes `n` permits, waiting up to `timeout` for them to appear.
    pub fn acquire_timeout(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.lock();
        while *count < n {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            count = guard;
        }
        *count -= n;
        true
    }

    /// Waits for `n` permits until they arrive or `stop` is raised.
    pub fn acquire_until_stopped(&self, n: usize, stop: &AtomicBool) -> bool {
        while !stop.load(Ordering::Relaxed) {
            if self.acquire_timeout(n, POLL_INTERVAL) {
                return true;
            }
        }
        false
    }

    pub fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        *self.lock() += n;
        self.changed.notify_all();
    }

    pub fn reset(&self, value: usize) {
        *self.lock() = value;
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn acquire_and_release_count() {
        let sem = CountingSemaphore::new(3);
        assert!(sem.try_acquire(2));
        assert!(!sem.try_acquire(2));
        sem.release(4);
        assert_eq!(sem.available(), 5);
        assert!(!sem.acquire_timeout(6, Duration::from_millis(1)));
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let sem = Arc::new(CountingSemaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire_timeout(2, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        sem.release(2);
        assert!(waiter.join().unwrap());
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn stop_flag_ends_wait() {
        let sem = CountingSemaphore::new(0);
        let stop = AtomicBool::new(true);
        assert!(!sem.acquire_until_stopped(1, &stop));
    }
}
