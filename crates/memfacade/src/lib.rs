//! Instrumented global allocator.
//!
//! Every heap allocation goes through [`InstrumentedAlloc`], which forwards to
//! exactly one build-selected [`Backend`] (the system allocator, or mimalloc
//! with the `mimalloc` feature) and keeps a [`MemoryTracker`] charged with the
//! bytes the backend really commits. With the `guarded` feature a small
//! random sample of allocations is placed between guard pages by
//! [`GuardedAlloc`], so overflows and use-after-free fault at the access.
//!
//! ## Setup
//!
//! ```rust,no_run
//! use memfacade::{default_alloc, DefaultAlloc, SamplingOptions, GUARDED_ALLOC};
//!
//! #[global_allocator]
//! static GLOBAL: DefaultAlloc = default_alloc();
//!
//! fn main() {
//!     // Optional: without it the pool stays empty and nothing is sampled.
//!     if let Err(err) = GUARDED_ALLOC.init(&SamplingOptions::from_env()) {
//!         eprintln!("guarded sampling disabled: {err}");
//!     }
//! }
//! ```

pub mod accounting;
pub mod backend;
pub mod config;
pub mod facade;
pub mod guard;
#[cfg(feature = "guarded")]
pub mod guarded;
#[cfg(feature = "report")]
pub mod report;
pub mod request;
pub mod resolver;

pub use accounting::{
    AllocationTrace, CurrentMemoryTracker, Event, MemoryTracker, ProfileCounters, ProfileEvents,
};
pub use backend::{ActiveBackend, Backend, System, MIN_ALIGN};
#[cfg(feature = "mimalloc")]
pub use backend::Mimalloc;
pub use config::{ConfigError, SamplingOptions};
pub use facade::InstrumentedAlloc;
pub use guard::{memory_guard_install, memory_guard_remove, GuardError, GuardMechanism, GuardRegion};
#[cfg(feature = "guarded")]
pub use guarded::{FaultKind, FaultReport, GuardedAlloc, GuardedStats};
pub use request::{AllocationOutcome, AllocationRequest, OutOfMemory, RequestError};
pub use resolver::ResolvedSize;

/// Process-wide usage tracker charged by [`DefaultAlloc`].
pub static CURRENT_MEMORY_TRACKER: CurrentMemoryTracker = CurrentMemoryTracker::new();

/// Process-wide guarded-allocation counters.
pub static PROFILE_COUNTERS: ProfileCounters = ProfileCounters::new();

/// Process-wide guarded pool. Inert until [`GuardedAlloc::init`].
#[cfg(feature = "guarded")]
pub static GUARDED_ALLOC: GuardedAlloc = GuardedAlloc::new();

/// The facade over the build's backend and the process-wide instances.
pub type DefaultAlloc = InstrumentedAlloc<ActiveBackend>;

/// A [`DefaultAlloc`] wired to [`CURRENT_MEMORY_TRACKER`],
/// [`PROFILE_COUNTERS`] and, with `guarded`, [`GUARDED_ALLOC`].
pub const fn default_alloc() -> DefaultAlloc {
    let alloc = InstrumentedAlloc::new(ActiveBackend::new(), &CURRENT_MEMORY_TRACKER, &PROFILE_COUNTERS);
    #[cfg(feature = "guarded")]
    let alloc = alloc.with_guarded(&GUARDED_ALLOC);
    alloc
}
