#![allow(dead_code)]

use std::alloc::Layout;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use memfacade::{AllocationTrace, Backend, Event, GuardedAlloc, MemoryTracker, ProfileEvents, SamplingOptions};

/// Rounding granularity of [`Rounding`].
pub const GRANULE: usize = 32;

/// Requests above this fail, standing in for an exhausted heap.
pub const LIMIT: usize = 1 << 32;

pub fn rounded(size: usize) -> usize {
    size.div_ceil(GRANULE) * GRANULE
}

/// Backend that commits sizes rounded up to [`GRANULE`] and records the
/// committed size in a header in front of each block, so both of its size
/// queries are exact.
pub struct Rounding;

const HEADER: usize = 2 * size_of::<usize>();

impl Rounding {
    unsafe fn header(ptr: *mut u8) -> (usize, usize) {
        let words = unsafe { ptr.sub(HEADER) } as *const usize;
        unsafe { (words.read(), words.add(1).read()) }
    }
}

unsafe impl Backend for Rounding {
    const NAME: &'static str = "rounding";

    unsafe fn alloc(&self, size: usize) -> *mut u8 {
        unsafe { self.alloc_aligned(size, 16) }
    }

    unsafe fn alloc_aligned(&self, size: usize, align: usize) -> *mut u8 {
        if size > LIMIT {
            return ptr::null_mut();
        }
        let offset = align.max(HEADER);
        let committed = rounded(size);
        let Ok(layout) = Layout::from_size_align(offset + committed, offset) else {
            return ptr::null_mut();
        };
        let base = unsafe { std::alloc::alloc(layout) };
        if base.is_null() {
            return base;
        }
        let ptr = unsafe { base.add(offset) };
        let words = unsafe { ptr.sub(HEADER) } as *mut usize;
        unsafe {
            words.write(committed);
            words.add(1).write(offset);
        }
        ptr
    }

    unsafe fn free(&self, ptr: *mut u8) {
        let (committed, offset) = unsafe { Self::header(ptr) };
        let layout = Layout::from_size_align(offset + committed, offset).unwrap();
        unsafe { std::alloc::dealloc(ptr.sub(offset), layout) }
    }

    fn good_size(&self, size: usize, _align: Option<usize>) -> Option<usize> {
        Some(rounded(size))
    }

    unsafe fn committed_size(&self, ptr: *mut u8, _align: Option<usize>) -> Option<usize> {
        Some(unsafe { Self::header(ptr) }.0)
    }
}

/// Backend that never has memory.
pub struct Exhausted;

unsafe impl Backend for Exhausted {
    const NAME: &'static str = "exhausted";

    unsafe fn alloc(&self, _size: usize) -> *mut u8 {
        ptr::null_mut()
    }

    unsafe fn alloc_aligned(&self, _size: usize, _align: usize) -> *mut u8 {
        ptr::null_mut()
    }

    unsafe fn free(&self, _ptr: *mut u8) {
        panic!("nothing was allocated");
    }
}

#[derive(Default)]
pub struct RecordingTracker {
    pub charged: AtomicUsize,
    pub released: AtomicUsize,
    pub charges: AtomicUsize,
    pub releases: AtomicUsize,
}

impl RecordingTracker {
    pub fn net(&self) -> i64 {
        self.charged.load(Ordering::SeqCst) as i64 - self.released.load(Ordering::SeqCst) as i64
    }

    pub fn charged(&self) -> usize {
        self.charged.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl MemoryTracker for RecordingTracker {
    fn alloc_no_throw(&self, size: usize) -> AllocationTrace {
        self.charges.fetch_add(1, Ordering::SeqCst);
        self.charged.fetch_add(size, Ordering::SeqCst);
        AllocationTrace {
            amount: self.net(),
            limit_exceeded: false,
        }
    }

    fn free(&self, size: usize) -> AllocationTrace {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.released.fetch_add(size, Ordering::SeqCst);
        AllocationTrace {
            amount: self.net(),
            limit_exceeded: false,
        }
    }
}

#[derive(Default)]
pub struct RecordingEvents {
    counts: [AtomicU64; 3],
}

impl RecordingEvents {
    pub fn get(&self, event: Event) -> u64 {
        self.counts[event as usize].load(Ordering::SeqCst)
    }
}

impl ProfileEvents for RecordingEvents {
    fn increment(&self, event: Event) {
        self.counts[event as usize].fetch_add(1, Ordering::SeqCst);
    }
}

pub fn leak<V>(value: V) -> &'static V {
    Box::leak(Box::new(value))
}

pub fn pool(options: SamplingOptions) -> &'static GuardedAlloc {
    let pool = leak(GuardedAlloc::new());
    pool.init(&options).expect("guarded pool");
    pool
}
