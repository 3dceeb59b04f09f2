//! Lock-free SPSC ring buffer between the decoder worker and the mixer (§4.1).
//!
//! Grounded on the top-level `src/audio/stream.rs` and
//! `vidplayer/src/audio/stream.rs` (`vidwall` has no `audio/stream.rs` of its
//! own — only `audio/mixer.rs`/`audio/mod.rs`)
//! (`AudioStreamProducer`/`AudioStreamConsumer`): a `ringbuf::HeapRb<f32>`
//! split into producer/consumer halves, each wrapped in a `Send + Sync`
//! newtype over `UnsafeCell` since `ringbuf`'s split halves are themselves
//! `!Sync` by design (they assume a single owning thread each, which is
//! exactly the SPSC contract here).

use std::cell::UnsafeCell;

use ringbuf::traits::{Consumer as _, Observer as _, Producer as _, Split as _};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Producer half, owned by the decoder worker thread.
pub struct RingProducer {
    inner: UnsafeCell<HeapProd<f32>>,
}

// SAFETY: a `RingProducer` is created once per reader and handed to exactly
// one decoder-worker thread; it is never shared or cloned. `push`/`skip`-side
// methods only ever run on that one thread, so the `UnsafeCell` access is
// single-threaded in practice even though the type itself must be `Send` to
// cross the thread-spawn boundary.
unsafe impl Send for RingProducer {}
unsafe impl Sync for RingProducer {}

/// Consumer half, owned by the mixer thread (via the reader).
pub struct RingConsumer {
    inner: UnsafeCell<HeapCons<f32>>,
}

// SAFETY: see `RingProducer` — exactly one consumer handle exists per
// reader, read only from the mixer thread via `Reader::read_at_time`.
unsafe impl Send for RingConsumer {}
unsafe impl Sync for RingConsumer {}

/// Build a ring buffer with the given sample capacity (not frame capacity —
/// a stereo buffer wanting 1s of audio at 48kHz needs `capacity = 96_000`).
pub fn ring_buffer(capacity_samples: usize) -> (RingProducer, RingConsumer) {
    let rb = HeapRb::<f32>::new(capacity_samples);
    let (prod, cons) = rb.split();
    (
        RingProducer {
            inner: UnsafeCell::new(prod),
        },
        RingConsumer {
            inner: UnsafeCell::new(cons),
        },
    )
}

impl RingProducer {
    #[allow(clippy::mut_from_ref)]
    fn prod(&self) -> &mut HeapProd<f32> {
        // SAFETY: single-writer invariant documented on the type.
        unsafe { &mut *self.inner.get() }
    }

    /// Writes as many samples from `span` as there is free capacity for.
    /// Never blocks. Returns the number of samples actually written.
    pub fn write(&self, span: &[f32]) -> usize {
        self.prod().push_slice(span)
    }

    pub fn available_free(&self) -> usize {
        self.prod().vacant_len()
    }

    pub fn capacity(&self) -> usize {
        self.prod().capacity().get()
    }
}

impl RingConsumer {
    #[allow(clippy::mut_from_ref)]
    fn cons(&self) -> &mut HeapCons<f32> {
        // SAFETY: single-reader invariant documented on the type.
        unsafe { &mut *self.inner.get() }
    }

    /// Reads as many samples into `span` as are available. Never blocks.
    /// Returns the number of samples actually read.
    pub fn read(&self, span: &mut [f32]) -> usize {
        self.cons().pop_slice(span)
    }

    /// Advances the read cursor by `n` samples without copying them out.
    /// Returns the number of samples actually skipped (may be less than `n`
    /// if fewer are available).
    pub fn skip(&self, n: usize) -> usize {
        self.cons().skip(n)
    }

    /// Discards all buffered samples without deallocating storage.
    pub fn clear(&self) {
        self.cons().clear();
    }

    pub fn available(&self) -> usize {
        self.cons().occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.cons().capacity().get()
    }

    pub fn is_empty(&self) -> bool {
        self.cons().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let (prod, cons) = ring_buffer(16);
        let data = [1.0_f32, 2.0, 3.0, 4.0];
        assert_eq!(prod.write(&data), 4);
        let mut out = [0.0_f32; 4];
        assert_eq!(cons.read(&mut out), 4);
        assert_eq!(out, data);
    }

    #[test]
    fn write_never_exceeds_free_capacity() {
        let (prod, _cons) = ring_buffer(4);
        let data = [0.0_f32; 8];
        assert_eq!(prod.write(&data), 4);
    }

    #[test]
    fn read_never_exceeds_available() {
        let (prod, cons) = ring_buffer(16);
        prod.write(&[1.0, 2.0]);
        let mut out = [0.0_f32; 8];
        assert_eq!(cons.read(&mut out), 2);
    }

    #[test]
    fn skip_advances_without_copying() {
        let (prod, cons) = ring_buffer(16);
        prod.write(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(cons.skip(2), 2);
        let mut out = [0.0_f32; 4];
        assert_eq!(cons.read(&mut out[..2]), 2);
        assert_eq!(&out[..2], &[3.0, 4.0]);
    }

    #[test]
    fn clear_empties_without_deallocating() {
        let (prod, cons) = ring_buffer(16);
        prod.write(&[1.0, 2.0, 3.0]);
        cons.clear();
        assert!(cons.is_empty());
        assert_eq!(cons.capacity(), 16);
    }

    #[test]
    fn concurrent_write_read_never_blocks() {
        use std::sync::Arc;
        use std::thread;

        let (prod, cons) = ring_buffer(4096);
        let prod = Arc::new(prod);
        let cons = Arc::new(cons);

        let writer = {
            let prod = Arc::clone(&prod);
            thread::spawn(move || {
                for chunk in 0..1000 {
                    let data = [chunk as f32; 4];
                    let mut written = 0;
                    while written < data.len() {
                        written += prod.write(&data[written..]);
                    }
                }
            })
        };

        let reader = {
            let cons = Arc::clone(&cons);
            thread::spawn(move || {
                let mut total = 0usize;
                let mut buf = [0.0_f32; 4];
                while total < 4000 {
                    total += cons.read(&mut buf);
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
    }

    /// Run with `--test-threads=1` for a reliable signal — the allocation
    /// counter is process-global and shared by every concurrently running
    /// test.
    #[test]
    fn steady_state_write_read_allocates_nothing() {
        let (prod, cons) = ring_buffer(4096);
        let data = [0.5_f32; 256];
        let mut out = [0.0_f32; 256];

        let before = crate::test_alloc::count();
        for _ in 0..100 {
            prod.write(&data);
            cons.read(&mut out);
        }
        assert_eq!(crate::test_alloc::count(), before);
    }
}
