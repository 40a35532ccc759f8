//! Accounting bridge between the facade and the process-wide usage tracker
//! and profile counters.
//!
//! Nothing here returns a `Result`. Tracker and counter implementations run
//! inside the global allocator, so they must not allocate, block on the heap,
//! or panic; what they report back is a best-effort [`AllocationTrace`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::resolver::ResolvedSize;

/// Best-effort result of one charge or release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationTrace {
    /// Live bytes after the operation, as seen by the tracker.
    pub amount: i64,
    /// The tracker's soft limit was exceeded by this charge.
    pub limit_exceeded: bool,
}

/// Process-wide counter of live heap bytes.
pub trait MemoryTracker: Sync {
    /// Charges `size` bytes. May note a limit violation but never fails.
    fn alloc_no_throw(&self, size: usize) -> AllocationTrace;

    /// Releases `size` bytes.
    fn free(&self, size: usize) -> AllocationTrace;
}

/// Default tracker: signed live-bytes counter with peak and an optional soft
/// limit.
#[derive(Debug)]
pub struct CurrentMemoryTracker {
    amount: AtomicI64,
    peak: AtomicI64,
    soft_limit: AtomicI64,
}

impl Default for CurrentMemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CurrentMemoryTracker {
    pub const fn new() -> Self {
        Self {
            amount: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            soft_limit: AtomicI64::new(0),
        }
    }

    /// Live bytes.
    pub fn amount(&self) -> i64 {
        self.amount.load(Ordering::Relaxed)
    }

    /// Highest live byte count observed.
    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Soft limit, 0 meaning none.
    pub fn soft_limit(&self) -> i64 {
        self.soft_limit.load(Ordering::Relaxed)
    }

    /// Sets the soft limit. Exceeding it is only flagged in traces.
    pub fn set_soft_limit(&self, limit: i64) {
        self.soft_limit.store(limit.max(0), Ordering::Relaxed);
    }
}

impl MemoryTracker for CurrentMemoryTracker {
    #[inline]
    fn alloc_no_throw(&self, size: usize) -> AllocationTrace {
        let size = clamp_to_i64(size);
        let amount = self.amount.fetch_add(size, Ordering::Relaxed).wrapping_add(size);
        self.peak.fetch_max(amount, Ordering::Relaxed);
        let limit = self.soft_limit.load(Ordering::Relaxed);
        AllocationTrace {
            amount,
            limit_exceeded: limit != 0 && amount > limit,
        }
    }

    #[inline]
    fn free(&self, size: usize) -> AllocationTrace {
        let size = clamp_to_i64(size);
        let amount = self.amount.fetch_sub(size, Ordering::Relaxed).wrapping_sub(size);
        AllocationTrace {
            amount,
            limit_exceeded: false,
        }
    }
}

#[inline]
fn clamp_to_i64(size: usize) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

/// Outcomes of the guarded sampling allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Event {
    GuardedAllocSuccess,
    GuardedAllocFailed,
    GuardedFree,
}

impl Event {
    pub const ALL: [Event; 3] = [
        Event::GuardedAllocSuccess,
        Event::GuardedAllocFailed,
        Event::GuardedFree,
    ];

    /// Stable counter name.
    pub const fn name(self) -> &'static str {
        match self {
            Event::GuardedAllocSuccess => "GWPAsanAllocateSuccess",
            Event::GuardedAllocFailed => "GWPAsanAllocateFailed",
            Event::GuardedFree => "GWPAsanFree",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Event::GuardedAllocSuccess => "Number of successful allocations done by the guarded sampling allocator",
            Event::GuardedAllocFailed => "Number of sampled allocations the guarded allocator could not place (pool exhausted or request too large)",
            Event::GuardedFree => "Number of frees done by the guarded sampling allocator",
        }
    }
}

/// Increment-only profile counters.
pub trait ProfileEvents: Sync {
    fn increment(&self, event: Event);
}

#[derive(Debug)]
pub struct ProfileCounters {
    counters: [AtomicU64; 3],
}

impl Default for ProfileCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileCounters {
    pub const fn new() -> Self {
        Self {
            counters: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    pub fn get(&self, event: Event) -> u64 {
        self.counters[event as usize].load(Ordering::Relaxed)
    }

    /// `(name, value)` pairs in declaration order.
    pub fn values(&self) -> [(&'static str, u64); 3] {
        Event::ALL.map(|event| (event.name(), self.get(event)))
    }
}

impl ProfileEvents for ProfileCounters {
    #[inline]
    fn increment(&self, event: Event) {
        self.counters[event as usize].fetch_add(1, Ordering::Relaxed);
    }
}

/// Charges a resolved allocation size.
#[inline]
pub fn charge_allocation<T: MemoryTracker + ?Sized>(tracker: &T, actual_size: usize) -> AllocationTrace {
    tracker.alloc_no_throw(actual_size)
}

/// Releases whatever the resolver recovered. An unknown size releases nothing.
#[inline]
pub fn release_allocation<T: MemoryTracker + ?Sized>(tracker: &T, resolved: ResolvedSize) -> AllocationTrace {
    tracker.free(resolved.bytes())
}

#[inline]
pub fn record<E: ProfileEvents + ?Sized>(events: &E, event: Event) {
    events.increment(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_tracker_charge_release() {
        let tracker = CurrentMemoryTracker::new();
        let trace = charge_allocation(&tracker, 48);
        assert_eq!(trace.amount, 48);
        assert!(!trace.limit_exceeded);
        let trace = release_allocation(&tracker, ResolvedSize::Exact(48));
        assert_eq!(trace.amount, 0);
        assert_eq!(tracker.peak(), 48);
    }

    #[test]
    fn test_unknown_size_releases_nothing() {
        let tracker = CurrentMemoryTracker::new();
        charge_allocation(&tracker, 10);
        release_allocation(&tracker, ResolvedSize::Unknown);
        assert_eq!(tracker.amount(), 10);
    }

    #[test]
    fn test_soft_limit_is_reported_not_enforced() {
        let tracker = CurrentMemoryTracker::new();
        tracker.set_soft_limit(100);
        assert!(!tracker.alloc_no_throw(100).limit_exceeded);
        let trace = tracker.alloc_no_throw(1);
        assert!(trace.limit_exceeded);
        assert_eq!(trace.amount, 101);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let tracker = Arc::new(CurrentMemoryTracker::new());
        let counters = Arc::new(ProfileCounters::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let counters = Arc::clone(&counters);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        tracker.alloc_no_throw(16);
                        counters.increment(Event::GuardedFree);
                    }
                    for _ in 0..5_000 {
                        tracker.free(16);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("Thread panicked");
        }
        assert_eq!(tracker.amount(), 8 * 5_000 * 16);
        assert_eq!(counters.get(Event::GuardedFree), 80_000);
        assert_eq!(counters.get(Event::GuardedAllocSuccess), 0);
    }

    #[test]
    fn test_counter_names() {
        let counters = ProfileCounters::new();
        counters.increment(Event::GuardedAllocFailed);
        assert_eq!(
            counters.values(),
            [
                ("GWPAsanAllocateSuccess", 0),
                ("GWPAsanAllocateFailed", 1),
                ("GWPAsanFree", 0),
            ]
        );
    }
}
