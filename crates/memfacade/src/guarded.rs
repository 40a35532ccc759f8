//! Guarded sampling allocator.
//!
//! A small, statistically sampled fraction of allocations is placed in a pool
//! of page-sized slots separated by guard pages:
//!
//! ```text
//! [guard][slot 0][guard][slot 1][guard] ... [slot n-1][guard]
//! ```
//!
//! Objects sit flush against a guard page, so touching one byte past them
//! faults immediately. Slots that are unused or freed are guarded as a whole,
//! so any use after free faults too. Placement failures are not errors: the
//! facade falls back to the backend and counts the miss.

mod fault;
pub(crate) mod sampler;

pub use fault::{FaultKind, FaultReport};

use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use tracing::{debug, error, trace};

use crate::backend::MIN_ALIGN;
use crate::config::{SamplingOptions, MAX_SLOTS};
use crate::guard::{memory_guard_install, memory_guard_remove, page_size, GuardError};

const POOL_UNINIT: u8 = 0;
const POOL_INITIALIZING: u8 = 1;
const POOL_READY: u8 = 2;

const SLOT_FREE: u8 = 0;
const SLOT_CLAIMED: u8 = 1;
const SLOT_BUSY: u8 = 2;
const SLOT_FREED: u8 = 3;

struct Slot {
    state: AtomicU8,
    ptr: AtomicUsize,
    size: AtomicUsize,
}

impl Slot {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(SLOT_FREE),
            ptr: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "report", derive(serde::Serialize))]
pub struct GuardedStats {
    pub slots: usize,
    pub in_use: usize,
    pub slot_size: usize,
    pub sample_probability: f64,
}

pub struct GuardedAlloc {
    state: AtomicU8,
    base: AtomicUsize,
    len: AtomicUsize,
    page: AtomicUsize,
    slot_count: AtomicUsize,
    slot_pages: AtomicUsize,
    /// `f64` bits.
    sample_probability: AtomicU64,
    left_align_ppm: AtomicU32,
    cursor: AtomicUsize,
    slots: [Slot; MAX_SLOTS],
}

impl Default for GuardedAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardedAlloc {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(POOL_UNINIT),
            base: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
            page: AtomicUsize::new(0),
            slot_count: AtomicUsize::new(0),
            slot_pages: AtomicUsize::new(0),
            sample_probability: AtomicU64::new(0),
            left_align_ppm: AtomicU32::new(0),
            cursor: AtomicUsize::new(0),
            slots: [const { Slot::new() }; MAX_SLOTS],
        }
    }

    /// Maps and guards the pool. Call once at process start, before sampling
    /// is expected; until then the pool owns nothing and samples nothing.
    pub fn init(&'static self, options: &SamplingOptions) -> Result<(), GuardError> {
        options.validate()?;
        let page = page_size();
        let slot_count = options.slots;
        let slot_pages = options.max_alloc_pages;
        let len = pool_len(page, slot_count, slot_pages).ok_or(GuardError::Map {
            len: usize::MAX,
            errno: libc::ENOMEM,
        })?;
        if self
            .state
            .compare_exchange(POOL_UNINIT, POOL_INITIALIZING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(GuardError::AlreadyInitialized);
        }
        let _inside = sampler::enter();

        let base = match map_pool(len) {
            Ok(base) => base,
            Err(err) => {
                self.state.store(POOL_UNINIT, Ordering::Release);
                return Err(err);
            }
        };
        if let Err(err) = memory_guard_install(base, len) {
            unsafe { libc::munmap(base as *mut c_void, len) };
            self.state.store(POOL_UNINIT, Ordering::Release);
            return Err(err);
        }

        self.page.store(page, Ordering::Relaxed);
        self.slot_count.store(slot_count, Ordering::Relaxed);
        self.slot_pages.store(slot_pages, Ordering::Relaxed);
        self.len.store(len, Ordering::Relaxed);
        self.left_align_ppm
            .store(to_ppm(options.left_align_probability), Ordering::Relaxed);
        self.set_sample_probability(options.sample_probability);
        self.base.store(base as usize, Ordering::Release);
        self.state.store(POOL_READY, Ordering::Release);

        debug!(
            "guarded pool at {:#x}+{:#x}: {} slots of {} bytes, sample probability {}",
            base as usize,
            len,
            slot_count,
            slot_pages * page,
            options.sample_probability
        );

        if options.handle_segv {
            fault::install_handler(self);
        }
        Ok(())
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == POOL_READY
    }

    /// Changes the sampling probability at runtime. 0 disables sampling;
    /// values outside `[0, 1]` are clamped. Threads pick it up after their
    /// current sampling gap.
    pub fn set_sample_probability(&self, probability: f64) {
        let probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        self.sample_probability
            .store(probability.to_bits(), Ordering::Relaxed);
    }

    pub fn sample_probability(&self) -> f64 {
        f64::from_bits(self.sample_probability.load(Ordering::Relaxed))
    }

    /// Cheap per-allocation check. Never true before `init`, nor for
    /// allocations made while this thread is inside the pool.
    #[inline]
    pub fn should_sample(&self) -> bool {
        if !self.is_initialized() {
            return false;
        }
        sampler::should_sample(self.sample_probability())
    }

    /// Places `size` bytes in a free slot.
    ///
    /// Plain requests (`align == None`) are aligned to the largest power of
    /// two dividing `size`, capped at [`MIN_ALIGN`], which keeps them flush
    /// against the guard page while satisfying any Rust layout of that size.
    pub fn allocate(&self, size: usize, align: Option<usize>) -> Option<NonNull<u8>> {
        if !self.is_initialized() {
            return None;
        }
        let _inside = sampler::enter()?;

        let page = self.page.load(Ordering::Relaxed);
        let slot_len = self.slot_pages.load(Ordering::Relaxed) * page;
        let align = align.unwrap_or_else(|| natural_align(size));
        if size == 0 || size > slot_len || align > page {
            return None;
        }

        let Some((index, previous)) = self.claim_slot() else {
            trace!("guarded pool exhausted, size {size}");
            return None;
        };
        let slot = &self.slots[index];
        let start = self.slot_start(index);

        if let Err(err) = memory_guard_remove(start as *mut u8, slot_len) {
            debug!("failed to unguard slot {index}: {err}");
            slot.state.store(previous, Ordering::Release);
            return None;
        }

        let ptr = if sampler::chance(self.left_align_ppm.load(Ordering::Relaxed)) {
            start
        } else {
            (start + slot_len - size) & !(align - 1)
        };
        slot.ptr.store(ptr, Ordering::Relaxed);
        slot.size.store(size, Ordering::Relaxed);
        slot.state.store(SLOT_BUSY, Ordering::Release);

        NonNull::new(ptr as *mut u8)
    }

    /// Returns a slot to the pool and guards it again.
    ///
    /// # Safety
    /// `ptr` must satisfy [`pointer_is_mine`](Self::pointer_is_mine).
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        let _inside = sampler::enter();
        let addr = ptr as usize;
        let Some(index) = self.slot_index(addr) else {
            error!("invalid free of {addr:#x}: guard page inside the guarded pool");
            return;
        };
        let slot = &self.slots[index];
        if slot
            .state
            .compare_exchange(SLOT_BUSY, SLOT_CLAIMED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            error!("double free of {addr:#x} in guarded slot {index}");
            return;
        }
        if slot.ptr.load(Ordering::Relaxed) != addr {
            slot.state.store(SLOT_BUSY, Ordering::Release);
            error!(
                "invalid free of {addr:#x}: slot {index} holds {:#x}",
                slot.ptr.load(Ordering::Relaxed)
            );
            return;
        }

        let slot_len = self.slot_pages.load(Ordering::Relaxed) * self.page.load(Ordering::Relaxed);
        if let Err(err) = memory_guard_install(self.slot_start(index) as *mut u8, slot_len) {
            error!("failed to guard freed slot {index}: {err}");
        }
        // ptr and size stay recorded for use-after-free reports.
        slot.state.store(SLOT_FREED, Ordering::Release);
    }

    /// Whether `ptr` lies in the pool (slot or guard page).
    #[inline]
    pub fn pointer_is_mine(&self, ptr: *const u8) -> bool {
        let base = self.base.load(Ordering::Acquire);
        if base == 0 {
            return false;
        }
        let addr = ptr as usize;
        addr >= base && addr - base < self.len.load(Ordering::Relaxed)
    }

    /// Requested size of a live guarded allocation, 0 for anything else.
    pub fn get_size(&self, ptr: *const u8) -> usize {
        let addr = ptr as usize;
        match self.slot_index(addr) {
            Some(index) => {
                let slot = &self.slots[index];
                if slot.state.load(Ordering::Acquire) == SLOT_BUSY
                    && slot.ptr.load(Ordering::Relaxed) == addr
                {
                    slot.size.load(Ordering::Relaxed)
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    pub fn stats(&self) -> GuardedStats {
        let slots = self.slot_count.load(Ordering::Relaxed);
        let in_use = self.slots[..slots]
            .iter()
            .filter(|slot| slot.state.load(Ordering::Relaxed) == SLOT_BUSY)
            .count();
        GuardedStats {
            slots,
            in_use,
            slot_size: self.slot_pages.load(Ordering::Relaxed) * self.page.load(Ordering::Relaxed),
            sample_probability: self.sample_probability(),
        }
    }

    /// Classifies a faulting address inside the pool.
    pub fn describe_fault(&self, addr: usize) -> Option<FaultReport> {
        if !self.pointer_is_mine(addr as *const u8) {
            return None;
        }
        let page = self.page.load(Ordering::Relaxed);
        let slot_len = self.slot_pages.load(Ordering::Relaxed) * page;
        let stride = slot_len + page;
        let offset = addr - self.base.load(Ordering::Relaxed);

        if offset >= page && (offset - page) % stride < slot_len {
            let index = (offset - page) / stride;
            return Some(self.classify_in_slot(index, addr));
        }

        // On a guard page: blame the nearest live neighbour.
        let right = offset / stride;
        let left = right.checked_sub(1);
        let candidates = [left, Some(right)];
        candidates
            .into_iter()
            .flatten()
            .filter(|&index| index < self.slot_count.load(Ordering::Relaxed))
            .filter_map(|index| self.live_neighbour(index, addr))
            .min_by_key(|report| report.distance())
            .or(Some(FaultReport::wild(addr)))
    }

    fn classify_in_slot(&self, index: usize, addr: usize) -> FaultReport {
        let slot = &self.slots[index];
        let ptr = slot.ptr.load(Ordering::Relaxed);
        let size = slot.size.load(Ordering::Relaxed);
        let kind = match slot.state.load(Ordering::Acquire) {
            SLOT_FREED => FaultKind::UseAfterFree,
            SLOT_BUSY if addr >= ptr + size => FaultKind::BufferOverflow,
            SLOT_BUSY if addr < ptr => FaultKind::BufferUnderflow,
            _ => return FaultReport::wild(addr),
        };
        FaultReport {
            kind,
            addr,
            slot: Some(index),
            alloc_ptr: ptr,
            alloc_size: size,
        }
    }

    fn live_neighbour(&self, index: usize, addr: usize) -> Option<FaultReport> {
        let slot = &self.slots[index];
        match slot.state.load(Ordering::Acquire) {
            SLOT_BUSY | SLOT_FREED => {}
            _ => return None,
        }
        let ptr = slot.ptr.load(Ordering::Relaxed);
        let size = slot.size.load(Ordering::Relaxed);
        let kind = if slot.state.load(Ordering::Relaxed) == SLOT_FREED {
            FaultKind::UseAfterFree
        } else if addr >= ptr + size {
            FaultKind::BufferOverflow
        } else {
            FaultKind::BufferUnderflow
        };
        Some(FaultReport {
            kind,
            addr,
            slot: Some(index),
            alloc_ptr: ptr,
            alloc_size: size,
        })
    }

    /// Claims a free or freed slot, scanning from a rotating cursor so freed
    /// slots are reused as late as possible.
    fn claim_slot(&self) -> Option<(usize, u8)> {
        let count = self.slot_count.load(Ordering::Relaxed);
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for step in 0..count {
            let index = (start + step) % count;
            let slot = &self.slots[index];
            let current = slot.state.load(Ordering::Relaxed);
            if current != SLOT_FREE && current != SLOT_FREED {
                continue;
            }
            if slot
                .state
                .compare_exchange(current, SLOT_CLAIMED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some((index, current));
            }
        }
        None
    }

    #[inline]
    fn slot_start(&self, index: usize) -> usize {
        let page = self.page.load(Ordering::Relaxed);
        let stride = (self.slot_pages.load(Ordering::Relaxed) + 1) * page;
        self.base.load(Ordering::Relaxed) + page + index * stride
    }

    /// Slot whose pages contain `addr`; `None` for guard pages and foreign
    /// addresses.
    fn slot_index(&self, addr: usize) -> Option<usize> {
        if !self.pointer_is_mine(addr as *const u8) {
            return None;
        }
        let page = self.page.load(Ordering::Relaxed);
        let slot_len = self.slot_pages.load(Ordering::Relaxed) * page;
        let stride = slot_len + page;
        let offset = (addr - self.base.load(Ordering::Relaxed)).checked_sub(page)?;
        if offset % stride >= slot_len {
            return None;
        }
        let index = offset / stride;
        (index < self.slot_count.load(Ordering::Relaxed)).then_some(index)
    }
}

/// Bytes spanned by `slots` slots of `slot_pages` pages and their guards.
fn pool_len(page: usize, slots: usize, slot_pages: usize) -> Option<usize> {
    slot_pages
        .checked_add(1)?
        .checked_mul(page)?
        .checked_mul(slots)?
        .checked_add(page)
}

fn map_pool(len: usize) -> Result<*mut u8, GuardError> {
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | map_noreserve(),
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(GuardError::Map {
            len,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        });
    }
    Ok(addr as *mut u8)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const fn map_noreserve() -> libc::c_int {
    libc::MAP_NORESERVE
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const fn map_noreserve() -> libc::c_int {
    0
}

#[inline]
pub(crate) fn natural_align(size: usize) -> usize {
    if size == 0 {
        return 1;
    }
    (1usize << size.trailing_zeros()).min(MIN_ALIGN)
}

fn to_ppm(probability: f64) -> u32 {
    (probability.clamp(0.0, 1.0) * 1_000_000.0).round() as u32
}
