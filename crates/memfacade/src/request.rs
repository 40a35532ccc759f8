use std::alloc::Layout;
use std::ptr::NonNull;

use thiserror::Error;

use crate::backend::MIN_ALIGN;

/// A single allocation request.
///
/// The backend alignment drops anything the plain entry point already
/// guarantees for this size (see [`normalize_align`]). The caller's alignment
/// is kept as well: guarded slots place objects tighter than the backend does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    size: usize,
    align: Option<usize>,
    requested_align: usize,
}

impl AllocationRequest {
    #[inline]
    pub const fn new(size: usize) -> Self {
        Self {
            size,
            align: None,
            requested_align: 1,
        }
    }

    /// Request with an explicit alignment, which must be a power of two.
    #[inline]
    pub const fn aligned(size: usize, align: usize) -> Result<Self, RequestError> {
        if !align.is_power_of_two() {
            return Err(RequestError::AlignNotPowerOfTwo(align));
        }
        Ok(Self {
            size,
            align: normalize_align(size, align),
            requested_align: align,
        })
    }

    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Alignment the backend's plain entry point does not already provide.
    #[inline]
    pub const fn align(&self) -> Option<usize> {
        self.align
    }

    /// Alignment as given by the caller; 1 for [`new`](Self::new).
    #[inline]
    pub const fn requested_align(&self) -> usize {
        self.requested_align
    }
}

impl From<Layout> for AllocationRequest {
    #[inline]
    fn from(layout: Layout) -> Self {
        Self {
            size: layout.size(),
            align: normalize_align(layout.size(), layout.align()),
            requested_align: layout.align(),
        }
    }
}

/// `None` when a plain allocation of `size` bytes is already aligned to
/// `align`. Backends only promise [`MIN_ALIGN`] to blocks at least that big;
/// smaller size classes are aligned to their own size.
#[inline]
pub(crate) const fn normalize_align(size: usize, align: usize) -> Option<usize> {
    if align <= MIN_ALIGN && align <= (if size > 1 { size } else { 1 }) {
        None
    } else {
        Some(align)
    }
}

/// A successful allocation and the size charged for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationOutcome {
    pub ptr: NonNull<u8>,
    /// Bytes charged to the usage tracker; at least the requested size.
    pub actual_size: usize,
    /// Whether the allocation lives in the guarded sampling pool.
    pub guarded: bool,
}

/// The backend could not satisfy a request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("memory allocation of {size} bytes (align {align}) failed")]
pub struct OutOfMemory {
    pub size: usize,
    pub align: usize,
}

impl OutOfMemory {
    pub(crate) fn for_request(request: &AllocationRequest) -> Self {
        Self {
            size: request.size,
            align: request.align.unwrap_or(MIN_ALIGN),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    #[error("alignment {0} is not a power of two")]
    AlignNotPowerOfTwo(usize),
}
