#![allow(dead_code)] // suppress warning when doing selective testing
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn init() {
    stateos_port_std::init_logging();
}

/// Give freshly spawned tasks ample time to reach their parking point.
pub fn settle() {
    std::thread::sleep(Duration::from_millis(150));
}

/// An atomic counter for checking an execution sequence.
pub struct SeqTracker {
    counter: AtomicUsize,
}

impl SeqTracker {
    /// Construct a `SeqTracker`.
    pub const fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    /// Assert that the counter is equal to `old` and then replace it with
    /// `new`.
    #[track_caller]
    pub fn expect_and_replace(&self, old: usize, new: usize) {
        let got = self.counter.load(Ordering::Relaxed);
        log::debug!("{} (expected: {}) → {}", got, old, new);
        assert_eq!(got, old, "expected {}, got {}", old, got);
        self.counter.store(new, Ordering::Relaxed);
    }
}
