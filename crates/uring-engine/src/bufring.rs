//! Buffer ring slab: a single unmanaged allocation registered with the
//! kernel as a provided-buffer ring, plus the incremental-consumption
//! refcount protocol layered on top of it. All state here lives on the
//! reactor thread; nothing in this module is shared across threads except
//! through the reactor's buffer-return queue, which is drained sequentially.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::sync::atomic::{AtomicU16, Ordering};

use io_uring::types::BufRingEntry;

use crate::error::ConstructionError;

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name always succeeds.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn alloc_zeroed_page_aligned<T>(count: usize) -> *mut T {
    assert!(count > 0);
    let page_size = page_size();
    let layout = Layout::from_size_align(count * std::mem::size_of::<T>(), page_size)
        .expect("buffer slab layout must be valid");
    // SAFETY: count and size_of::<T>() are both nonzero.
    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    ptr.cast()
}

/// Per-buffer bookkeeping for the incremental-consumption refcount protocol
/// (§4.5): only touched while processing the reactor's own queues, so plain
/// fields suffice — no atomics.
#[derive(Debug, Clone, Copy, Default)]
struct BufferState {
    offset: u32,
    refcount: u32,
    kernel_done: bool,
}

/// A reactor's pre-allocated pool of fixed-size receive chunks, registered
/// with the kernel as a provided-buffer ring under one group id.
pub struct BufferRingSlab {
    data: *mut u8,
    entries: usize,
    buffer_size: usize,
    mask: usize,
    ring: *mut BufRingEntry,
    local_tail: u16,
    shared_tail: *const AtomicU16,
    group_id: u16,
    incremental: bool,
    state: Box<[BufferState]>,
}

// SAFETY: the slab and ring allocations are only ever touched from the
// owning reactor thread; they're never aliased across threads.
unsafe impl Send for BufferRingSlab {}

impl BufferRingSlab {
    pub fn new(entries: usize, buffer_size: usize, group_id: u16, incremental: bool) -> Result<Self, ConstructionError> {
        if !entries.is_power_of_two() {
            return Err(ConstructionError::NotPowerOfTwo {
                field: "buffer_ring_entries",
                value: entries,
            });
        }

        let data = alloc_zeroed_page_aligned::<u8>(entries * buffer_size);
        let ring = alloc_zeroed_page_aligned::<BufRingEntry>(entries);

        // SAFETY: `ring` was just allocated with `entries` elements; `data`
        // with `entries * buffer_size` bytes, so each chunk start/len pair
        // below is in bounds.
        unsafe {
            let ring_slice = std::slice::from_raw_parts_mut(ring, entries);
            for (buffer_id, entry) in ring_slice.iter_mut().enumerate() {
                let chunk = data.add(buffer_id * buffer_size);
                entry.set_addr(chunk as u64);
                entry.set_len(buffer_size as u32);
                entry.set_bid(buffer_id as u16);
            }
        }

        let local_tail = entries as u16;
        // SAFETY: `ring` has at least one entry; `tail` returns a pointer
        // into that first entry's header, valid before kernel registration.
        let tail_addr = unsafe { BufRingEntry::tail(ring.cast_const()) };
        // SAFETY: not yet shared with the kernel, so a plain write is fine.
        unsafe { *tail_addr.cast_mut() = local_tail };
        let shared_tail: *const AtomicU16 = tail_addr.cast();

        Ok(Self {
            data,
            entries,
            buffer_size,
            mask: entries - 1,
            ring,
            local_tail,
            shared_tail,
            group_id,
            incremental,
            state: vec![BufferState::default(); entries].into_boxed_slice(),
        })
    }

    pub fn group_id(&self) -> u16 {
        self.group_id
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Raw ring pointer and entry count, for passing to
    /// [`crate::kernel::KernelRing::register_buf_ring`].
    pub fn ring_ptr_and_count(&self) -> (u64, u16) {
        (self.ring as u64, self.entries as u16)
    }

    /// Pointer to the start of buffer `buffer_id` plus however many bytes of
    /// it are valid, given a receive completion's `(buffer_id, result_len)`.
    /// With incremental consumption on, the valid bytes start at that
    /// buffer's tracked `offset` rather than its base.
    pub fn chunk_for_completion(&mut self, buffer_id: u16, result_len: u32, terminal: bool) -> (*const u8, usize) {
        let idx = buffer_id as usize;
        debug_assert!(idx < self.entries);
        // SAFETY: idx < entries, and this chunk is exclusively owned by the
        // reactor until the matching buffer id is returned and republished.
        let base = unsafe { self.data.add(idx * self.buffer_size) };

        if self.incremental {
            let state = &mut self.state[idx];
            let ptr = unsafe { base.add(state.offset as usize) };
            state.offset += result_len;
            state.refcount += 1;
            state.kernel_done = terminal;
            (ptr, result_len as usize)
        } else {
            (base, result_len as usize)
        }
    }

    /// Processes a returned buffer id. Returns `true` if the buffer should
    /// be republished to the ring this pass.
    pub fn on_return(&mut self, buffer_id: u16) -> bool {
        if !self.incremental {
            return true;
        }
        let state = &mut self.state[buffer_id as usize];
        debug_assert!(state.refcount > 0, "return with no outstanding reference");
        state.refcount = state.refcount.saturating_sub(1);
        if state.refcount == 0 && state.kernel_done {
            state.offset = 0;
            state.kernel_done = false;
            true
        } else {
            false
        }
    }

    /// Re-adds `buffer_id` to the local shadow ring at the next slot; call
    /// [`BufferRingSlab::publish`] once per reactor iteration to make the
    /// additions visible to the kernel.
    pub fn add(&mut self, buffer_id: u16) {
        let idx = (self.local_tail as usize) & self.mask;
        // SAFETY: idx is masked into range; the ring allocation has `entries` slots.
        unsafe {
            let entry = &mut *self.ring.add(idx);
            let chunk = self.data.add(buffer_id as usize * self.buffer_size);
            entry.set_addr(chunk as u64);
            entry.set_len(self.buffer_size as u32);
            entry.set_bid(buffer_id);
        }
        self.local_tail = self.local_tail.wrapping_add(1);
    }

    /// Publishes every addition queued since the last call, with a single
    /// release store on the shared tail.
    pub fn publish(&self) {
        // SAFETY: shared_tail is valid for the registration's lifetime.
        unsafe { (*self.shared_tail).store(self.local_tail, Ordering::Release) };
    }
}

impl Drop for BufferRingSlab {
    fn drop(&mut self) {
        let ring_layout = Layout::from_size_align(
            self.entries * std::mem::size_of::<BufRingEntry>(),
            page_size(),
        )
        .unwrap();
        let data_layout =
            Layout::from_size_align(self.entries * self.buffer_size, page_size()).unwrap();
        // SAFETY: both allocations were made with these exact layouts in `new`.
        unsafe {
            dealloc(self.ring.cast(), ring_layout);
            dealloc(self.data, data_layout);
        }
    }
}
