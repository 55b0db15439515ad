//! Sequence-per-slot bounded MPSC queue (Vyukov-style).
//!
//! Unlike [`crate::Ring`] (single producer) or [`crate::mpsc_ring::Ring`]
//! (monotonic shared tail, consumer tolerates a visibility window), this
//! queue gives every slot its own sequence number so a producer can tell,
//! without consulting the consumer, whether the slot it was assigned is
//! actually free yet. That makes it suitable for a bounded queue with many
//! uncoordinated producers and a single consumer that must never block on a
//! producer that is still mid-publish.

use crate::cache_aligned::CacheAligned;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slot<T> {
    /// `sequence == index`: empty, ready for a producer.
    /// `sequence == index + 1`: full, ready for the consumer.
    /// `sequence == index + capacity`: empty again, ready for the next lap.
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded multi-producer single-consumer queue.
///
/// Producers reserve a unique slot with an atomic fetch-add on a shared
/// tail counter, then spin until that slot's sequence number confirms it is
/// free before publishing. The consumer is ordinary: it only ever looks at
/// its own `head`.
pub struct Queue<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    head: CacheAligned<AtomicUsize>,
    tail: CacheAligned<AtomicUsize>,
}

// SAFETY: `Slot<T>`'s value is only accessed by the producer that wins the
// CAS-free reservation on its sequence number, and by the single consumer
// once that producer has published — never concurrently by two threads.
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    /// Creates a queue with the given power-of-two capacity.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let buffer = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buffer,
            mask: capacity - 1,
            head: CacheAligned::new(AtomicUsize::new(0)),
            tail: CacheAligned::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Attempts to enqueue `item` without blocking. Returns `Err(item)` if
    /// the queue is momentarily full (every slot's lap not yet freed by the
    /// consumer).
    pub fn try_enqueue(&self, item: T) -> Result<(), T> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[tail & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - tail as isize;

            match diff.cmp(&0) {
                std::cmp::Ordering::Equal => {
                    match self.tail.compare_exchange_weak(
                        tail,
                        tail.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            // SAFETY: this producer alone owns slot `tail` until it
                            // publishes, since the sequence check above proved no
                            // other producer has claimed it yet.
                            unsafe { (*slot.value.get()).write(item) };
                            slot.sequence.store(tail.wrapping_add(1), Ordering::Release);
                            return Ok(());
                        }
                        Err(cur) => tail = cur,
                    }
                }
                std::cmp::Ordering::Less => return Err(item),
                std::cmp::Ordering::Greater => tail = self.tail.load(Ordering::Relaxed),
            }
        }
    }

    /// Enqueues `item`, spinning with the shared [`crate::Backoff`] helper
    /// until a slot frees up. Used by contexts that must not drop an item,
    /// such as a kernel-thread buffer return.
    pub fn enqueue_spin(&self, mut item: T) {
        let mut backoff = crate::Backoff::new();
        loop {
            match self.try_enqueue(item) {
                Ok(()) => return,
                Err(returned) => {
                    item = returned;
                    backoff.snooze();
                }
            }
        }
    }

    /// Attempts to dequeue a single item. Only the consumer may call this.
    pub fn try_dequeue(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.buffer[head & self.mask];
        let seq = slot.sequence.load(Ordering::Acquire);
        let diff = seq as isize - (head.wrapping_add(1)) as isize;

        if diff != 0 {
            return None;
        }

        // SAFETY: sequence == head + 1 means a producer finished publishing
        // this slot and no other consumer exists to race this read.
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        slot.sequence
            .store(head.wrapping_add(self.capacity()), Ordering::Release);
        self.head.store(head.wrapping_add(1), Ordering::Relaxed);
        Some(item)
    }

    /// Drains every item currently dequeueable, in FIFO order.
    pub fn drain<F: FnMut(T)>(&self, mut handler: F) -> usize {
        let mut count = 0;
        while let Some(item) = self.try_dequeue() {
            handler(item);
            count += 1;
        }
        count
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        while self.try_dequeue().is_some() {}
    }
}
