mod common;

use std::alloc::{GlobalAlloc, Layout};

use common::{leak, pool, rounded, Exhausted, RecordingEvents, RecordingTracker, Rounding, GRANULE, LIMIT};
use memfacade::{
    AllocationRequest, Event, InstrumentedAlloc, OutOfMemory, SamplingOptions, MIN_ALIGN,
};

type Facade<B> = InstrumentedAlloc<B, RecordingTracker, RecordingEvents>;

fn facade<B: memfacade::Backend + 'static>(backend: B) -> Facade<B> {
    InstrumentedAlloc::new(backend, leak(RecordingTracker::default()), leak(RecordingEvents::default()))
}

#[test]
fn test_size_symmetry() {
    let alloc = facade(Rounding);
    let aligns = [None, Some(32), Some(64), Some(4096)];
    for size in [1, 7, 16, 33, 40, 100, 4000, 70_000] {
        for align in aligns {
            let request = match align {
                Some(align) => AllocationRequest::aligned(size, align).unwrap(),
                None => AllocationRequest::new(size),
            };

            let charged = alloc.tracker().charged();
            let unsized_free = alloc.allocate_no_throw(request).unwrap();
            assert_eq!(unsized_free.actual_size, rounded(size));
            let sized_free = alloc.allocate_no_throw(request).unwrap();
            assert_eq!(alloc.tracker().charged() - charged, 2 * rounded(size));

            let released = alloc.tracker().released();
            unsafe { alloc.deallocate(unsized_free.ptr.as_ptr()) };
            assert_eq!(alloc.tracker().released() - released, unsized_free.actual_size);
            unsafe { alloc.deallocate_sized(sized_free.ptr.as_ptr(), size, align) };
            assert_eq!(alloc.tracker().net(), 0, "size {size}, align {align:?}");
        }
    }
}

#[test]
fn test_aligned_pointers_are_aligned() {
    let alloc = facade(Rounding);
    for align in [32, 64, 256, 4096] {
        let outcome = alloc
            .allocate(AllocationRequest::aligned(24, align).unwrap())
            .unwrap();
        assert_eq!(outcome.ptr.as_ptr() as usize % align, 0);
        unsafe { alloc.deallocate_sized(outcome.ptr.as_ptr(), 24, Some(align)) };
    }
    assert_eq!(alloc.tracker().net(), 0);
}

#[test]
fn test_null_alignment_equivalence() {
    let alloc = facade(Rounding);
    let plain = AllocationRequest::new(40);
    let min_aligned = AllocationRequest::aligned(40, MIN_ALIGN).unwrap();
    assert_eq!(plain.size(), min_aligned.size());
    assert_eq!(plain.align(), min_aligned.align());

    let a = alloc.allocate(plain).unwrap();
    let b = alloc.allocate(min_aligned).unwrap();
    assert_eq!(a.actual_size, b.actual_size);
    for outcome in [a, b] {
        assert_eq!(outcome.ptr.as_ptr() as usize % MIN_ALIGN, 0);
        unsafe {
            outcome.ptr.as_ptr().write_bytes(0xab, 40);
            alloc.deallocate(outcome.ptr.as_ptr());
        }
    }
    assert_eq!(alloc.tracker().net(), 0);
}

#[test]
fn test_aligned_40_bytes_roundtrip() {
    let alloc = facade(Rounding).with_guarded(pool(SamplingOptions::new().sample_probability(0.0)));

    let outcome = alloc
        .allocate(AllocationRequest::aligned(40, 16).unwrap())
        .unwrap();
    assert!(!outcome.guarded);
    assert!(outcome.actual_size >= 40);
    assert_eq!(outcome.actual_size % GRANULE, 0);
    assert_eq!(alloc.tracker().charged(), outcome.actual_size);

    unsafe { alloc.deallocate(outcome.ptr.as_ptr()) };
    assert_eq!(alloc.tracker().released(), outcome.actual_size);
    assert_eq!(alloc.tracker().net(), 0);
    assert_eq!(alloc.events().get(Event::GuardedAllocSuccess), 0);
    assert_eq!(alloc.events().get(Event::GuardedAllocFailed), 0);
}

#[test]
fn test_always_sample_8_bytes() {
    let pool = pool(SamplingOptions::new().sample_probability(1.0).slots(4));
    let alloc = facade(Rounding).with_guarded(pool);

    let outcome = alloc.allocate(AllocationRequest::new(8)).unwrap();
    assert!(outcome.guarded);
    assert!(pool.pointer_is_mine(outcome.ptr.as_ptr()));
    assert_eq!(alloc.tracker().charged(), 8);

    unsafe { alloc.deallocate(outcome.ptr.as_ptr()) };
    assert_eq!(alloc.events().get(Event::GuardedFree), 1);
    assert_eq!(alloc.events().get(Event::GuardedAllocSuccess), 1);
    assert_eq!(alloc.events().get(Event::GuardedAllocFailed), 0);
    assert_eq!(alloc.tracker().net(), 0);
}

#[test]
fn test_always_sample_keeps_requested_alignment() {
    let pool = pool(SamplingOptions::new().sample_probability(1.0).slots(4));
    let alloc = facade(Rounding).with_guarded(pool);

    let outcome = alloc
        .allocate(AllocationRequest::aligned(40, 16).unwrap())
        .unwrap();
    assert!(outcome.guarded);
    assert_eq!(outcome.ptr.as_ptr() as usize % 16, 0);
    assert_eq!(alloc.tracker().charged(), 40);

    let small = alloc
        .allocate(AllocationRequest::aligned(8, MIN_ALIGN).unwrap())
        .unwrap();
    assert!(small.guarded);
    assert_eq!(small.ptr.as_ptr() as usize % MIN_ALIGN, 0);

    unsafe {
        alloc.deallocate(outcome.ptr.as_ptr());
        alloc.deallocate_sized(small.ptr.as_ptr(), 8, Some(MIN_ALIGN));
    }
    assert_eq!(alloc.events().get(Event::GuardedFree), 2);
    assert_eq!(alloc.tracker().net(), 0);
}

#[test]
fn test_failed_sample_falls_through() {
    let pool = pool(SamplingOptions::new().sample_probability(1.0).slots(1));
    let alloc = facade(Rounding).with_guarded(pool);

    let first = alloc.allocate(AllocationRequest::new(64)).unwrap();
    let second = alloc.allocate(AllocationRequest::new(64)).unwrap();
    let too_big = alloc.allocate(AllocationRequest::new(1 << 20)).unwrap();
    assert!(first.guarded);
    assert!(!second.guarded);
    assert!(!too_big.guarded);
    assert!(!pool.pointer_is_mine(second.ptr.as_ptr()));
    assert_eq!(second.actual_size, rounded(64));
    assert_eq!(alloc.events().get(Event::GuardedAllocSuccess), 1);
    assert_eq!(alloc.events().get(Event::GuardedAllocFailed), 2);

    unsafe {
        alloc.deallocate_sized(second.ptr.as_ptr(), 64, None);
        alloc.deallocate(too_big.ptr.as_ptr());
        alloc.deallocate_sized(first.ptr.as_ptr(), 64, None);
    }
    assert_eq!(alloc.events().get(Event::GuardedFree), 1);
    assert_eq!(alloc.tracker().net(), 0);
}

#[test]
fn test_non_throwing_never_raises() {
    let exhausted = facade(Exhausted);
    for size in [0, 1, 40, 1 << 20, usize::MAX] {
        assert!(exhausted.allocate_no_throw(AllocationRequest::new(size)).is_none());
        assert_eq!(
            exhausted.allocate(AllocationRequest::new(size)).unwrap_err(),
            OutOfMemory { size, align: MIN_ALIGN }
        );
    }
    assert_eq!(exhausted.tracker().charged(), 0);

    let alloc = facade(Rounding);
    assert!(alloc.allocate_no_throw(AllocationRequest::new(LIMIT + 1)).is_none());
    assert!(alloc
        .allocate_no_throw(AllocationRequest::aligned(usize::MAX - 64, 4096).unwrap())
        .is_none());
    let empty = alloc.allocate_no_throw(AllocationRequest::new(0)).unwrap();
    assert_eq!(empty.actual_size, 0);
    unsafe { alloc.deallocate(empty.ptr.as_ptr()) };
    assert_eq!(alloc.tracker().net(), 0);
}

#[test]
fn test_null_deallocation_is_ignored() {
    let alloc = facade(Exhausted);
    unsafe {
        alloc.deallocate(std::ptr::null_mut());
        alloc.deallocate_sized(std::ptr::null_mut(), 16, None);
    }
    assert_eq!(alloc.tracker().releases.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[test]
fn test_global_alloc_interface() {
    let pool = pool(SamplingOptions::new().sample_probability(0.5).slots(8));
    let alloc = facade(Rounding).with_guarded(pool);
    let mut blocks = Vec::new();
    for size in 1..200usize {
        let layout = Layout::from_size_align(size, if size % 3 == 0 { 64 } else { 8 }).unwrap();
        let ptr = unsafe { alloc.alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % layout.align(), 0);
        assert!(unsafe { std::slice::from_raw_parts(ptr, size) }.iter().all(|&b| b == 0));
        let grown = unsafe { alloc.realloc(ptr, layout, size * 2) };
        assert!(!grown.is_null());
        blocks.push((grown, Layout::from_size_align(size * 2, layout.align()).unwrap()));
    }
    for (ptr, layout) in blocks {
        unsafe { alloc.dealloc(ptr, layout) };
    }
    assert_eq!(alloc.tracker().net(), 0);
    assert_eq!(
        alloc.events().get(Event::GuardedAllocSuccess),
        alloc.events().get(Event::GuardedFree)
    );
}

#[cfg(feature = "mimalloc")]
mod mimalloc_backend {
    use super::*;
    use memfacade::Mimalloc;

    #[test]
    fn test_size_symmetry() {
        let alloc = facade(Mimalloc::new());
        for size in [0, 1, 7, 8, 16, 40, 100, 4000, 70_000] {
            for align in [None, Some(8), Some(16), Some(32), Some(64), Some(4096)] {
                let request = match align {
                    Some(align) => AllocationRequest::aligned(size, align).unwrap(),
                    None => AllocationRequest::new(size),
                };

                let unsized_free = alloc.allocate_no_throw(request).unwrap();
                assert!(unsized_free.actual_size >= size);
                let released = alloc.tracker().released();
                unsafe { alloc.deallocate(unsized_free.ptr.as_ptr()) };
                assert_eq!(
                    alloc.tracker().released() - released,
                    unsized_free.actual_size,
                    "size {size}, align {align:?}"
                );

                let sized_free = alloc.allocate_no_throw(request).unwrap();
                unsafe { alloc.deallocate_sized(sized_free.ptr.as_ptr(), size, align) };
                assert_eq!(alloc.tracker().net(), 0, "size {size}, align {align:?}");
            }
        }
    }

    #[test]
    fn test_small_layouts_are_aligned() {
        let alloc = facade(Mimalloc::new());
        for (size, align) in [(1, 2), (4, 8), (8, 16), (12, 16), (24, 32), (8, 8)] {
            let layout = Layout::from_size_align(size, align).unwrap();
            let blocks: Vec<_> = (0..64).map(|_| unsafe { alloc.alloc(layout) }).collect();
            for &ptr in &blocks {
                assert!(!ptr.is_null());
                assert_eq!(ptr as usize % align, 0, "layout {layout:?}");
            }
            for ptr in blocks {
                unsafe { alloc.dealloc(ptr, layout) };
            }
        }
        assert_eq!(alloc.tracker().net(), 0);
    }

    #[test]
    fn test_unsized_release_of_aligned_block_is_exact() {
        let alloc = facade(Mimalloc::new());
        let outcome = alloc
            .allocate(AllocationRequest::aligned(40, 64).unwrap())
            .unwrap();
        assert_eq!(outcome.ptr.as_ptr() as usize % 64, 0);
        assert!(outcome.actual_size >= 40);
        let resolved = unsafe {
            memfacade::resolver::resolve_release(alloc.backend(), outcome.ptr.as_ptr(), None)
        };
        assert_eq!(resolved, memfacade::ResolvedSize::Exact(outcome.actual_size));
        unsafe { alloc.deallocate(outcome.ptr.as_ptr()) };
        assert_eq!(alloc.tracker().net(), 0);
    }
}
