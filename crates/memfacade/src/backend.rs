//! Backend allocator adapter.
//!
//! Exactly one native heap is active per build. [`ActiveBackend`] names it, and
//! everything above this module is written against the [`Backend`] trait so the
//! backend identity is only branched on here.

mod system;
pub use system::System;

#[cfg(feature = "mimalloc")]
mod mimalloc;
#[cfg(feature = "mimalloc")]
pub use self::mimalloc::Mimalloc;

/// Alignment every backend guarantees for plain allocations of at least this
/// many bytes. Smaller blocks are only aligned to their size class.
#[cfg(target_pointer_width = "64")]
pub const MIN_ALIGN: usize = 16;
#[cfg(target_pointer_width = "32")]
pub const MIN_ALIGN: usize = 8;

cfg_if::cfg_if! {
    if #[cfg(feature = "mimalloc")] {
        /// Backend selected for this build.
        pub type ActiveBackend = Mimalloc;
    } else {
        /// Backend selected for this build.
        pub type ActiveBackend = System;
    }
}

/// Uniform operations over a native heap.
///
/// # Safety
///
/// Implementors must return memory that stays valid until it is passed back to
/// `free` or `free_sized`. Plain blocks are aligned to [`MIN_ALIGN`], or to the
/// largest power of two not above their size if that is smaller;
/// `alloc_aligned` honours the requested alignment. Size queries must not allocate and must not
/// panic: they run inside the global allocator.
pub unsafe trait Backend: Sync {
    /// Name shown in reports.
    const NAME: &'static str;

    /// # Safety
    /// Same contract as `malloc`.
    unsafe fn alloc(&self, size: usize) -> *mut u8;

    /// # Safety
    /// `align` must be a power of two.
    unsafe fn alloc_aligned(&self, size: usize, align: usize) -> *mut u8;

    /// # Safety
    /// `ptr` must come from this backend and not be freed yet.
    unsafe fn free(&self, ptr: *mut u8);

    /// Sized free. Backends without a sized primitive fall back to `free`.
    ///
    /// # Safety
    /// `size` and `align` must match the allocation that produced `ptr`.
    unsafe fn free_sized(&self, ptr: *mut u8, size: usize, align: Option<usize>) {
        let _ = (size, align);
        unsafe { self.free(ptr) }
    }

    /// Bytes the backend would commit for `size`, computed without allocating.
    /// `None` when the backend has no such primitive.
    fn good_size(&self, size: usize, align: Option<usize>) -> Option<usize> {
        let _ = (size, align);
        None
    }

    /// Exact committed size of a live allocation, if the backend can tell.
    /// Unsized frees pass no alignment, so the answer must not depend on it.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this backend.
    unsafe fn committed_size(&self, ptr: *mut u8, align: Option<usize>) -> Option<usize> {
        let _ = (ptr, align);
        None
    }

    /// Usable size of a live allocation. May exceed what was charged for it.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this backend.
    unsafe fn usable_size(&self, ptr: *mut u8) -> Option<usize> {
        let _ = ptr;
        None
    }
}

/// Allocates through `backend`, picking the aligned entry only when the
/// alignment exceeds what the plain entry already guarantees.
///
/// # Safety
/// See [`Backend::alloc`].
#[inline]
pub(crate) unsafe fn alloc_with<B: Backend>(backend: &B, size: usize, align: Option<usize>) -> *mut u8 {
    match align {
        Some(align) => unsafe { backend.alloc_aligned(size, align) },
        None => unsafe { backend.alloc(size) },
    }
}
