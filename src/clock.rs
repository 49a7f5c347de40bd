//! Monotonic clock and id allocation
//!
//! Provides a wall-clock timestamp that never goes backward, a configurable
//! safety margin for garbage-collection decisions, and a monotonic allocator
//! for cluster-unique ids.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// A clock source that guarantees monotonically increasing timestamps
/// and provides skew-aware cutoffs for orphan cleanup.
pub struct BoundedClock {
    /// High-water mark: the largest timestamp we've ever returned (nanos)
    high_water_ns: AtomicI64,
    /// Maximum tolerated clock skew (nanos). Applied as a safety margin
    /// when computing orphan cutoffs to avoid premature deletion.
    max_skew_ns: i64,
}

impl BoundedClock {
    pub fn new(max_skew: std::time::Duration) -> Self {
        Self {
            high_water_ns: AtomicI64::new(0),
            max_skew_ns: max_skew.as_nanos() as i64,
        }
    }

    /// Returns a monotonically increasing nanosecond timestamp.
    ///
    /// If the wall clock has gone backward (e.g. NTP adjustment),
    /// returns the previous high-water mark + 1ns instead.
    pub fn now_nanos(&self) -> i64 {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        loop {
            let prev = self.high_water_ns.load(Ordering::Acquire);
            let ts = wall.max(prev + 1);
            match self.high_water_ns.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(_) => continue, // CAS failed, retry
            }
        }
    }

    /// Returns `chrono::DateTime<Utc>` from the monotonic clock.
    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.now_nanos())
    }

    /// Returns an orphan cutoff timestamp that accounts for clock skew.
    ///
    /// The cutoff is shifted earlier by `max_skew` so that rows whose
    /// timestamps were recorded on a clock running ahead are not reaped
    /// prematurely.
    pub fn orphan_cutoff_nanos(&self, orphan_timeout_nanos: i64) -> i64 {
        self.now_nanos() - orphan_timeout_nanos - self.max_skew_ns
    }
}

impl Default for BoundedClock {
    fn default() -> Self {
        // 30 second default — generous enough for most NTP-synced environments
        Self::new(std::time::Duration::from_secs(30))
    }
}

/// Allocator for cluster-unique, strictly increasing ids.
///
/// Index and build ids must strictly increase within a coordinator lifetime
/// and across restarts; the allocator is seeded with the highest id recovered
/// from the metadata store on init.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicI64,
}

impl IdAllocator {
    /// Create an allocator whose first id is `last_seen + 1`.
    pub fn new(last_seen: i64) -> Self {
        Self {
            next: AtomicI64::new(last_seen + 1),
        }
    }

    pub fn alloc(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Bump the allocator past an id observed in the store.
    pub fn observe(&self, seen: i64) {
        let mut current = self.next.load(Ordering::SeqCst);
        while current <= seen {
            match self.next.compare_exchange_weak(
                current,
                seen + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new(0)
    }
}
