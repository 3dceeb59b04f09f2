//! Counting global allocator for this crate's own test binary, validating
//! Testable Property 5 (no allocation on the audio path after warm-up).
//!
//! `examples/other_examples` `emuell-phonic` reaches for the `assert_no_alloc`
//! crate for the same purpose; a ~15-line wrapper around `std::alloc::System`
//! covers the same need here without a dependency only this test binary
//! would ever use.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

pub struct CountingAlloc;

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        unsafe { System.alloc_zeroed(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

/// Current allocation count. Tests take a before/after delta rather than
/// asserting an absolute value, since other tests running concurrently in
/// the same process share this counter.
pub fn count() -> usize {
    ALLOCATIONS.load(Ordering::Relaxed)
}
