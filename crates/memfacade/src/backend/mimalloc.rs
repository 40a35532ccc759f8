use std::ffi::c_void;

use libmimalloc_sys as ffi;

use super::Backend;

/// mimalloc arena allocator.
///
/// `mi_good_size` gives the committed size of a plain allocation without
/// allocating, and `mi_usable_size` recovers it from a live pointer. Aligned
/// and empty blocks have no size formula (the tail depends on where the
/// pointer lands), so they are charged by measuring the live block.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mimalloc;

impl Mimalloc {
    pub const fn new() -> Self {
        Self
    }
}

unsafe impl Backend for Mimalloc {
    const NAME: &'static str = "mimalloc";

    #[inline]
    unsafe fn alloc(&self, size: usize) -> *mut u8 {
        unsafe { ffi::mi_malloc(size) as *mut u8 }
    }

    #[inline]
    unsafe fn alloc_aligned(&self, size: usize, align: usize) -> *mut u8 {
        unsafe { ffi::mi_malloc_aligned(size, align) as *mut u8 }
    }

    #[inline]
    unsafe fn free(&self, ptr: *mut u8) {
        unsafe { ffi::mi_free(ptr as *mut c_void) }
    }

    #[inline]
    unsafe fn free_sized(&self, ptr: *mut u8, size: usize, align: Option<usize>) {
        match align {
            Some(align) => unsafe { ffi::mi_free_size_aligned(ptr as *mut c_void, size, align) },
            None => unsafe { ffi::mi_free_size(ptr as *mut c_void, size) },
        }
    }

    #[inline]
    fn good_size(&self, size: usize, align: Option<usize>) -> Option<usize> {
        match align {
            None if size != 0 => Some(unsafe { ffi::mi_good_size(size) }),
            _ => None,
        }
    }

    #[inline]
    unsafe fn committed_size(&self, ptr: *mut u8, _align: Option<usize>) -> Option<usize> {
        Some(unsafe { ffi::mi_usable_size(ptr as *const c_void) })
    }

    #[inline]
    unsafe fn usable_size(&self, ptr: *mut u8) -> Option<usize> {
        Some(unsafe { ffi::mi_usable_size(ptr as *const c_void) })
    }
}
