use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Strictly increasing millisecond-based id source.
///
/// Returns the wall clock in milliseconds unless that would not exceed the
/// previously issued value, in which case it returns `previous + 1`. Used for
/// auth nonces and heartbeat message ids, both of which the venue expects to
/// grow monotonically even when several are issued within the same millisecond
/// or the clock steps backwards.
#[derive(Debug, Default)]
pub struct MonotonicMillis {
    last: AtomicU64,
}

impl MonotonicMillis {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Last issued value (0 before the first call)
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}
