//! Committed-size resolution.
//!
//! The tracker is charged with what the backend really commits, not with what
//! the caller asked for. Release has to recover the same number for the same
//! pointer; [`ResolvedSize`] says how much that number can be trusted.

use crate::backend::Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedSize {
    /// Computed by a backend primitive.
    Exact(usize),
    /// The nominal size; the backend offers nothing better. Exact as long as
    /// both sides of the pair use it.
    Declared(usize),
    /// A usable-size query on a backend that can't compute committed sizes.
    /// It may exceed what was charged.
    Approximate(usize),
    /// Nothing could be recovered; nothing is released.
    Unknown,
}

impl ResolvedSize {
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            ResolvedSize::Exact(n) | ResolvedSize::Declared(n) | ResolvedSize::Approximate(n) => n,
            ResolvedSize::Unknown => 0,
        }
    }

    #[inline]
    pub const fn is_exact(self) -> bool {
        matches!(self, ResolvedSize::Exact(_) | ResolvedSize::Declared(_))
    }
}

/// Size to charge for a request of `size` bytes that the backend served at
/// `ptr`.
///
/// `good_size` is asked first since it needs no pointer. Backends without it
/// can still measure the live block; that size is charged so an unsized free,
/// which only has the pointer, releases the same number.
///
/// # Safety
/// `ptr` must be null or a live allocation of `backend`.
#[inline]
pub unsafe fn resolve_allocation<B: Backend>(
    backend: &B,
    size: usize,
    align: Option<usize>,
    ptr: *mut u8,
) -> ResolvedSize {
    if let Some(actual) = backend.good_size(size, align) {
        return ResolvedSize::Exact(actual.max(size));
    }
    if !ptr.is_null() {
        if let Some(actual) = unsafe { backend.committed_size(ptr, align) } {
            return ResolvedSize::Exact(actual);
        }
    }
    ResolvedSize::Declared(size)
}

/// Size to release for `ptr`.
///
/// A declared `(size, align)` goes through the same computation as
/// [`resolve_allocation`], so sized frees always mirror their charge. Unsized
/// frees ask the backend for the committed size, then, with
/// `relaxed-accounting`, for its approximate usable size.
///
/// # Safety
/// `ptr` must be a live allocation of `backend` (or null).
#[inline]
pub unsafe fn resolve_release<B: Backend>(
    backend: &B,
    ptr: *mut u8,
    declared: Option<(usize, Option<usize>)>,
) -> ResolvedSize {
    if let Some((size, align)) = declared {
        return unsafe { resolve_allocation(backend, size, align, ptr) };
    }
    if ptr.is_null() {
        return ResolvedSize::Unknown;
    }
    if let Some(actual) = unsafe { backend.committed_size(ptr, None) } {
        return ResolvedSize::Exact(actual);
    }
    approximate(backend, ptr)
}

#[cfg(feature = "relaxed-accounting")]
#[inline]
fn approximate<B: Backend>(backend: &B, ptr: *mut u8) -> ResolvedSize {
    match unsafe { backend.usable_size(ptr) } {
        Some(usable) => ResolvedSize::Approximate(usable),
        None => ResolvedSize::Unknown,
    }
}

#[cfg(not(feature = "relaxed-accounting"))]
#[inline]
fn approximate<B: Backend>(_backend: &B, _ptr: *mut u8) -> ResolvedSize {
    ResolvedSize::Unknown
}
