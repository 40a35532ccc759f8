use std::ffi::c_void;
use std::ptr;

use super::Backend;

/// Platform `malloc`. No "size without allocating" primitive exists, so
/// charged sizes are nominal and unsized frees can only be measured
/// approximately.
#[derive(Debug, Default, Clone, Copy)]
pub struct System;

impl System {
    pub const fn new() -> Self {
        Self
    }
}

unsafe impl Backend for System {
    const NAME: &'static str = "system";

    #[inline]
    unsafe fn alloc(&self, size: usize) -> *mut u8 {
        unsafe { libc::malloc(size) as *mut u8 }
    }

    #[inline]
    unsafe fn alloc_aligned(&self, size: usize, align: usize) -> *mut u8 {
        // posix_memalign rejects alignments below the pointer size.
        let align = align.max(std::mem::size_of::<usize>());
        let mut out: *mut c_void = ptr::null_mut();
        let ret = unsafe { libc::posix_memalign(&mut out, align, size) };
        if ret != 0 {
            return ptr::null_mut();
        }
        out as *mut u8
    }

    #[inline]
    unsafe fn free(&self, ptr: *mut u8) {
        unsafe { libc::free(ptr as *mut c_void) }
    }

    #[inline]
    unsafe fn usable_size(&self, ptr: *mut u8) -> Option<usize> {
        if ptr.is_null() {
            return Some(0);
        }
        usable_size_impl(ptr)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[inline]
fn usable_size_impl(ptr: *mut u8) -> Option<usize> {
    Some(unsafe { libc::malloc_usable_size(ptr as *mut c_void) })
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
#[inline]
fn usable_size_impl(ptr: *mut u8) -> Option<usize> {
    Some(unsafe { libc::malloc_size(ptr as *const c_void) })
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
#[inline]
fn usable_size_impl(_ptr: *mut u8) -> Option<usize> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_has_no_exact_queries() {
        let backend = System::new();
        assert_eq!(backend.good_size(40, None), None);
        unsafe {
            let ptr = backend.alloc(40);
            assert!(!ptr.is_null());
            assert_eq!(backend.committed_size(ptr, None), None);
            #[cfg(any(target_os = "linux", target_os = "macos"))]
            assert!(backend.usable_size(ptr).unwrap() >= 40);
            backend.free(ptr);
        }
    }

    #[test]
    fn test_small_alignment_is_widened() {
        let backend = System::new();
        unsafe {
            let ptr = backend.alloc_aligned(3, 1);
            assert!(!ptr.is_null());
            backend.free(ptr);
        }
    }
}
