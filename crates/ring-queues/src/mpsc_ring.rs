//! Monotonic-tail MPSC ring (flush-request queue).
//!
//! Every producer reserves a unique slot with an atomic `fetch_add` on a
//! single shared tail counter — cheap, lock-free, and correct for multiple
//! producers without per-slot sequence bookkeeping. The tradeoff is a
//! visibility window: a producer can reserve slot N and be descheduled
//! before it writes the value there, so the consumer must not trust
//! `tail` itself as "everything up to here is written". Instead the
//! consumer takes one snapshot of tail per drain pass and only reads a slot
//! once it independently confirms that slot carries this pass's generation
//! stamp, so a slot reserved-but-not-yet-written is simply left for the
//! next pass rather than read torn or twice.

use crate::cache_aligned::CacheAligned;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

struct Slot<T> {
    /// Generation stamp of the write currently in this slot. `u64::MAX`
    /// means "not yet written for its current lap".
    written: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded multi-producer single-consumer ring tolerant of the
/// reserve/publish race inherent to a shared monotonic tail.
pub struct Ring<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    tail: CacheAligned<AtomicU64>,
    /// Written only by the single consumer, but read by every producer to
    /// judge fullness, so this needs real cross-thread visibility — unlike
    /// the `head`s in [`crate::Ring`]/[`crate::vyukov::Queue`], a plain
    /// `UnsafeCell` here would let a producer spin forever on a stale value.
    head: CacheAligned<AtomicU64>,
}

// SAFETY: a slot is written by at most one producer (the thread that won
// the fetch_add for that generation) and read by the single consumer only
// after `written` confirms the write is visible.
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let buffer = (0..capacity)
            .map(|_| Slot {
                written: AtomicU64::new(u64::MAX),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buffer,
            mask: capacity - 1,
            tail: CacheAligned::new(AtomicU64::new(0)),
            head: CacheAligned::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Reserves a unique slot and publishes `item` into it. Returns `false`
    /// if the ring is momentarily full (the consumer has not yet freed the
    /// slot this generation needs).
    ///
    /// The fullness check and the ticket claim must happen atomically
    /// together: an unconditional `fetch_add` would hand out a ticket even
    /// when full, permanently skipping that sequence position (the
    /// consumer would then stall forever waiting for a slot nothing ever
    /// writes).
    #[allow(clippy::cast_possible_truncation)]
    pub fn try_enqueue(&self, item: T) -> bool {
        let mut tail = self.tail.load(Ordering::Relaxed);
        let ticket = loop {
            let head = self.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) as usize >= self.capacity() {
                return false;
            }
            match self.tail.compare_exchange_weak(
                tail,
                tail.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break tail,
                Err(cur) => tail = cur,
            }
        };

        let idx = (ticket as usize) & self.mask;
        let slot = &self.buffer[idx];
        // SAFETY: this ticket is unique (won the CAS) and the capacity check
        // above proves the consumer has already freed this slot's previous
        // lap, so no other thread can be touching `value` right now.
        unsafe { (*slot.value.get()).write(item) };
        slot.written.store(ticket, Ordering::Release);
        true
    }

    /// Spins (via the shared [`crate::Backoff`]) until the item is enqueued.
    pub fn enqueue_spin(&self, item: T)
    where
        T: Clone,
    {
        let mut backoff = crate::Backoff::new();
        loop {
            if self.try_enqueue(item.clone()) {
                return;
            }
            backoff.snooze();
        }
    }

    /// Drains every slot that is both reserved-before-`snapshot` and has
    /// finished publishing, stopping at the first unwritten or unreserved
    /// slot. Items reserved but not yet written are left for the next pass.
    pub fn drain_until<F: FnMut(T)>(&self, snapshot: u64, mut handler: F) -> usize {
        let mut head = self.head.load(Ordering::Relaxed);
        let mut count = 0;

        while head != snapshot {
            let idx = (head as usize) & self.mask;
            let slot = &self.buffer[idx];
            if slot.written.load(Ordering::Acquire) != head {
                break;
            }

            // SAFETY: `written == head` confirms the producer's release
            // store happened, and the consumer reads each slot at most once
            // per lap before advancing head past it.
            let item = unsafe { (*slot.value.get()).assume_init_read() };
            handler(item);
            count += 1;
            head = head.wrapping_add(1);
        }

        self.head.store(head, Ordering::Release);
        count
    }

    /// Snapshot of the shared tail, for pairing with [`Ring::drain_until`].
    pub fn snapshot_tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let snapshot = self.tail.load(Ordering::Acquire);
        self.drain_until(snapshot, |_| {});
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_producer_fifo() {
        let ring = Ring::<u32>::new(8);
        for i in 0..8 {
            assert!(ring.try_enqueue(i));
        }
        assert!(!ring.try_enqueue(99));

        let snapshot = ring.snapshot_tail();
        let mut seen = Vec::new();
        ring.drain_until(snapshot, |v| seen.push(v));
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_producers_all_delivered() {
        let ring = Arc::new(Ring::<u64>::new(256));
        let producers = 6;
        let per_producer = 500u64;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..per_producer {
                        ring.enqueue_spin(p * per_producer + i);
                    }
                })
            })
            .collect();

        let mut received = Vec::new();
        let total = (producers * per_producer) as usize;
        while received.len() < total {
            let snapshot = ring.snapshot_tail();
            ring.drain_until(snapshot, |v| received.push(v));
        }

        for h in handles {
            h.join().unwrap();
        }
        received.sort_unstable();
        received.dedup();
        assert_eq!(received.len(), total);
    }
}
