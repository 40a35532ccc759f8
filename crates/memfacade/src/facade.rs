//! The allocation facade: backend, resolver, accounting and the guarded pool
//! composed behind one set of entry points.

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::{self, NonNull};

use crate::accounting::{
    charge_allocation, release_allocation, CurrentMemoryTracker, MemoryTracker, ProfileCounters,
    ProfileEvents,
};
use crate::backend::{alloc_with, Backend};
use crate::request::{normalize_align, AllocationOutcome, AllocationRequest, OutOfMemory};
use crate::resolver::{resolve_allocation, resolve_release};

#[cfg(feature = "guarded")]
use crate::accounting::{record, Event};
#[cfg(feature = "guarded")]
use crate::guarded::{natural_align, GuardedAlloc};
#[cfg(feature = "guarded")]
use crate::resolver::ResolvedSize;

/// Instrumented allocator over backend `B`.
///
/// Every successful allocation charges `tracker` with the size the backend
/// really commits, and every deallocation releases what its pointer was
/// charged. With a guarded pool attached, sampled allocations are served from
/// guard-paged slots instead and counted in `events`.
///
/// Construction is `const`, so it can back a `#[global_allocator]`:
///
/// ```rust
/// use memfacade::{
///     GuardedAlloc, InstrumentedAlloc, System, CurrentMemoryTracker, ProfileCounters,
/// };
///
/// static TRACKER: CurrentMemoryTracker = CurrentMemoryTracker::new();
/// static COUNTERS: ProfileCounters = ProfileCounters::new();
/// static POOL: GuardedAlloc = GuardedAlloc::new();
///
/// #[global_allocator]
/// static GLOBAL: InstrumentedAlloc<System> =
///     InstrumentedAlloc::new(System::new(), &TRACKER, &COUNTERS).with_guarded(&POOL);
///
/// fn main() {}
/// ```
pub struct InstrumentedAlloc<B, T = CurrentMemoryTracker, E = ProfileCounters>
where
    B: Backend + 'static,
    T: MemoryTracker + 'static,
    E: ProfileEvents + 'static,
{
    backend: B,
    tracker: &'static T,
    events: &'static E,
    #[cfg(feature = "guarded")]
    guarded: Option<&'static GuardedAlloc>,
}

impl<B, T, E> InstrumentedAlloc<B, T, E>
where
    B: Backend + 'static,
    T: MemoryTracker + 'static,
    E: ProfileEvents + 'static,
{
    pub const fn new(backend: B, tracker: &'static T, events: &'static E) -> Self {
        Self {
            backend,
            tracker,
            events,
            #[cfg(feature = "guarded")]
            guarded: None,
        }
    }

    /// Attaches a guarded pool. It samples nothing until
    /// [`GuardedAlloc::init`] has run.
    #[cfg(feature = "guarded")]
    pub const fn with_guarded(mut self, pool: &'static GuardedAlloc) -> Self {
        self.guarded = Some(pool);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn tracker(&self) -> &'static T {
        self.tracker
    }

    pub fn events(&self) -> &'static E {
        self.events
    }

    #[cfg(feature = "guarded")]
    pub fn guarded(&self) -> Option<&'static GuardedAlloc> {
        self.guarded
    }

    /// Allocates, or fails with [`OutOfMemory`]. Never yields null.
    #[inline]
    pub fn allocate(&self, request: AllocationRequest) -> Result<AllocationOutcome, OutOfMemory> {
        self.allocate_inner(request)
            .ok_or_else(|| OutOfMemory::for_request(&request))
    }

    /// Allocates, or returns `None`. Never panics, whatever the input.
    #[inline]
    pub fn allocate_no_throw(&self, request: AllocationRequest) -> Option<AllocationOutcome> {
        self.allocate_inner(request)
    }

    /// Frees `ptr` without a declared size. Null is a no-op.
    ///
    /// # Safety
    /// `ptr` must have been returned by this allocator and not freed since.
    #[inline]
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        unsafe { self.release(ptr, None) }
    }

    /// Frees `ptr` allocated with `size` and `align`. Null is a no-op.
    ///
    /// # Safety
    /// As [`deallocate`](Self::deallocate), and `size`/`align` must be the
    /// values the allocation was requested with.
    #[inline]
    pub unsafe fn deallocate_sized(&self, ptr: *mut u8, size: usize, align: Option<usize>) {
        let align = align.and_then(|align| normalize_align(size, align));
        unsafe { self.release(ptr, Some((size, align))) }
    }

    #[inline]
    fn allocate_inner(&self, request: AllocationRequest) -> Option<AllocationOutcome> {
        #[cfg(feature = "guarded")]
        if let Some(outcome) = self.try_guarded(&request) {
            return Some(outcome);
        }

        let (size, align) = (request.size(), request.align());
        let ptr = NonNull::new(unsafe { alloc_with(&self.backend, size, align) })?;
        let actual_size = unsafe { resolve_allocation(&self.backend, size, align, ptr.as_ptr()) }.bytes();
        charge_allocation(self.tracker, actual_size);
        Some(AllocationOutcome {
            ptr,
            actual_size,
            guarded: false,
        })
    }

    #[cfg(feature = "guarded")]
    #[inline]
    fn try_guarded(&self, request: &AllocationRequest) -> Option<AllocationOutcome> {
        let pool = self.guarded?;
        if !pool.should_sample() {
            return None;
        }
        let size = request.size();
        // Slots place objects at their natural alignment unless asked for more.
        let align = request.requested_align().max(natural_align(size));
        match pool.allocate(size, Some(align)) {
            Some(ptr) => {
                record(self.events, Event::GuardedAllocSuccess);
                charge_allocation(self.tracker, size);
                Some(AllocationOutcome {
                    ptr,
                    actual_size: size,
                    guarded: true,
                })
            }
            None => {
                record(self.events, Event::GuardedAllocFailed);
                None
            }
        }
    }

    #[inline]
    unsafe fn release(&self, ptr: *mut u8, declared: Option<(usize, Option<usize>)>) {
        if ptr.is_null() {
            return;
        }

        #[cfg(feature = "guarded")]
        if let Some(pool) = self.guarded.filter(|pool| pool.pointer_is_mine(ptr)) {
            // Zero for a pointer that isn't live: the pool reports it, nothing
            // was charged for it.
            let size = pool.get_size(ptr);
            if size != 0 {
                release_allocation(self.tracker, ResolvedSize::Exact(size));
                record(self.events, Event::GuardedFree);
            }
            unsafe { pool.deallocate(ptr) };
            return;
        }

        let resolved = unsafe { resolve_release(&self.backend, ptr, declared) };
        release_allocation(self.tracker, resolved);
        unsafe {
            match declared {
                Some((size, align)) => self.backend.free_sized(ptr, size, align),
                None => self.backend.free(ptr),
            }
        }
    }
}

// `alloc_zeroed` and `realloc` keep their provided bodies, which go through
// `alloc` and `dealloc`, so their accounting stays paired.
unsafe impl<B, T, E> GlobalAlloc for InstrumentedAlloc<B, T, E>
where
    B: Backend + 'static,
    T: MemoryTracker + 'static,
    E: ProfileEvents + 'static,
{
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.allocate_inner(AllocationRequest::from(layout)) {
            Some(outcome) => outcome.ptr.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let align = normalize_align(layout.size(), layout.align());
        unsafe { self.release(ptr, Some((layout.size(), align))) }
    }
}
