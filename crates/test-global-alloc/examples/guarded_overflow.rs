use std::process;
use std::ptr;

use memfacade::{default_alloc, DefaultAlloc, SamplingOptions, GUARDED_ALLOC};

#[global_allocator]
static GLOBAL: DefaultAlloc = default_alloc();

fn main() {
    GUARDED_ALLOC
        .init(&SamplingOptions::new().sample_probability(0.0).handle_segv(true))
        .expect("guarded pool");

    GUARDED_ALLOC.set_sample_probability(1.0);
    let buf = vec![0u8; 24].into_boxed_slice();
    GUARDED_ALLOC.set_sample_probability(0.0);

    let ptr = Box::into_raw(buf) as *mut u8;
    if !GUARDED_ALLOC.pointer_is_mine(ptr) {
        eprintln!("allocation was not sampled");
        process::exit(2);
    }

    let overflow = std::env::args().nth(1).as_deref() != Some("use-after-free");
    unsafe {
        if overflow {
            ptr::write_volatile(ptr.add(24), 1);
        } else {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, 24)));
            let _ = ptr::read_volatile(ptr);
        }
    }

    eprintln!("bad access did not fault");
    process::exit(3);
}
