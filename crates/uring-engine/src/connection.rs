//! The rendezvous between a Reactor (producer of inbound chunks, consumer
//! of outbound send progress) and a handler task (consumer of inbound
//! chunks, producer of outbound bytes).

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ring_queues::{mpsc_ring, vyukov, Config as RingConfig, Ring};
use tokio::sync::Notify;

use crate::cancel::CancelToken;
use crate::error::{ContractViolation, ErrorCode, InsufficientSpace, WriteError};

/// Write slabs are handed straight to `io_uring::opcode::Send` as raw
/// pointers; 64-byte alignment keeps a slab's cache lines from straddling
/// two DMA-relevant boundaries, matching the receive side's page alignment.
const WRITE_SLAB_ALIGN: usize = 64;

/// A zeroed, 64-byte aligned allocation of write-slab cells, freed with the
/// same layout it was allocated with.
struct AlignedSlab {
    ptr: *mut std::cell::UnsafeCell<u8>,
    len: usize,
}

impl AlignedSlab {
    fn new(len: usize) -> Self {
        assert!(len > 0, "write_slab_size must be nonzero");
        let layout = Self::layout(len);
        // SAFETY: len is nonzero and WRITE_SLAB_ALIGN is a valid power of two.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        Self { ptr: ptr.cast(), len }
    }

    fn layout(len: usize) -> Layout {
        Layout::from_size_align(len, WRITE_SLAB_ALIGN).expect("write slab layout must be valid")
    }
}

impl std::ops::Deref for AlignedSlab {
    type Target = [std::cell::UnsafeCell<u8>];
    fn deref(&self) -> &Self::Target {
        // SAFETY: ptr/len describe the allocation made in `new`, valid for
        // the lifetime of this AlignedSlab.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for AlignedSlab {
    fn drop(&mut self) {
        // SAFETY: same layout used to allocate in `new`.
        unsafe { dealloc(self.ptr.cast(), Self::layout(self.len)) };
    }
}

// SAFETY: ownership of the allocation transfers wholesale; no aliasing
// pointer escapes an AlignedSlab.
unsafe impl Send for AlignedSlab {}

/// A received chunk: a raw pointer into the owning reactor's buffer-ring
/// slab, a length in bytes, and the buffer id it must eventually be
/// returned under. Valid only until that id is returned.
#[derive(Debug, Clone, Copy)]
pub struct RingItem {
    pub ptr: *const u8,
    pub len: usize,
    pub buffer_id: u16,
}

// SAFETY: a RingItem's pointer addresses memory owned by the reactor's
// buffer-ring slab, which outlives every item produced from it; the SPSC
// ring discipline ensures exactly one thread (producer then consumer) ever
// touches a given item.
unsafe impl Send for RingItem {}

impl RingItem {
    /// # Safety
    /// Valid only until `buffer_id` is returned via [`Connection::return_ring`].
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}

/// The result handed to a read waiter: a tail position at the instant of
/// observation, a closed flag, and an error code. Items strictly below
/// `tail` are drainable; items produced afterwards belong to the next cycle.
#[derive(Debug, Clone, Copy)]
pub struct ReadSnapshot {
    pub tail: u64,
    pub closed: bool,
    pub error_code: ErrorCode,
}

impl ReadSnapshot {
    fn closed(error_code: ErrorCode) -> Self {
        Self { tail: 0, closed: true, error_code }
    }
}

/// An outbound send request with an unmanaged pointer/length, for the
/// optional multi-buffer gathered-send path. The primary write path uses
/// the connection's write slab directly and never constructs this type.
#[derive(Debug, Clone, Copy)]
pub struct WriteItem {
    pub ptr: *const u8,
    pub len: usize,
    pub descriptor: RawFd,
}

// SAFETY: see RingItem — ownership of the referenced bytes is established
// by the caller's use of the single-writer write slab discipline.
unsafe impl Send for WriteItem {}

/// Result handed to a flush waiter.
#[derive(Debug, Clone, Copy)]
pub struct FlushResult {
    pub closed: bool,
    pub error_code: ErrorCode,
}

/// One-shot, single-waiter completion primitive keyed by generation. Built
/// on `tokio::sync::Notify` the way the corpus's stream adapters coordinate
/// producer/consumer wakeups, but scoped to exactly one outstanding waiter.
struct Suspend<T> {
    notify: Notify,
    armed: AtomicBool,
    result: std::sync::Mutex<Option<T>>,
}

impl<T> Suspend<T> {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            armed: AtomicBool::new(false),
            result: std::sync::Mutex::new(None),
        }
    }

    /// Attempts to arm the waiter. `false` means a waiter is already armed —
    /// a contract violation for the caller to report.
    fn try_arm(&self) -> bool {
        self.armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Reactor-side: if a waiter is armed, disarm it and signal with `value`.
    /// Otherwise returns `value` back so the caller can fall back (e.g. to
    /// setting `pending`).
    fn signal_if_armed(&self, value: T) -> Result<(), T> {
        if self
            .armed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.result.lock().unwrap() = Some(value);
            self.notify.notify_one();
            Ok(())
        } else {
            Err(value)
        }
    }

    async fn wait(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(v) = self.result.lock().unwrap().take() {
                return v;
            }
            notified.await;
            if let Some(v) = self.result.lock().unwrap().take() {
                return v;
            }
        }
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

/// A non-owning handle back to the owning reactor's input queues, shared
/// (not owned) by every Connection it produced. Matches the cyclic
/// reactor/connection graph: the reactor owns its connections via a map,
/// the connection only ever reaches back through these queues.
pub struct ReactorHandle {
    pub return_queue: Arc<vyukov::Queue<u16>>,
    pub flush_queue: Arc<mpsc_ring::Ring<RawFd>>,
}

pub struct Connection {
    // --- Identity ---
    /// Reactor-owned: rebound only while the connection sits in the
    /// reactor's free pool, between `fast_clear()` and the next accept.
    fd: std::cell::Cell<RawFd>,
    reactor_id: usize,
    generation: AtomicU64,
    reactor: ReactorHandle,

    // --- Inbound ---
    ring: Ring<RingItem>,
    pending: AtomicBool,
    closed: AtomicBool,
    close_error: std::sync::atomic::AtomicU8,
    read_waiter: Suspend<ReadSnapshot>,

    // --- Outbound ---
    write_slab: AlignedSlab,
    head: AtomicUsize,
    tail: AtomicUsize,
    in_flight: AtomicUsize,
    flush_in_progress: AtomicBool,
    /// Reactor-owned: only ever touched on the reactor thread while
    /// processing flush requests and send completions.
    send_inflight: std::cell::Cell<bool>,
    flush_waiter: Suspend<FlushResult>,
}

// SAFETY: `write_slab`'s UnsafeCell<u8> cells are written only by the
// handler (single writer) up to `tail`, and read only by the reactor for
// `[head, in_flight)` after `in_flight` has been published with Release —
// the two ranges the threads touch never overlap in time for the same byte.
unsafe impl Sync for Connection {}

fn error_code_from_u8(v: u8) -> ErrorCode {
    match v {
        1 => ErrorCode::Eof,
        2 => ErrorCode::ReceiveFailed,
        3 => ErrorCode::SendFailed,
        4 => ErrorCode::RingFull,
        5 => ErrorCode::StaleGeneration,
        6 => ErrorCode::Cancelled,
        _ => ErrorCode::None,
    }
}

fn error_code_to_u8(e: ErrorCode) -> u8 {
    match e {
        ErrorCode::None => 0,
        ErrorCode::Eof => 1,
        ErrorCode::ReceiveFailed => 2,
        ErrorCode::SendFailed => 3,
        ErrorCode::RingFull => 4,
        ErrorCode::StaleGeneration => 5,
        ErrorCode::Cancelled => 6,
    }
}

impl Connection {
    pub fn new(
        fd: RawFd,
        reactor_id: usize,
        reactor: ReactorHandle,
        inbound_ring_capacity: usize,
        write_slab_size: usize,
    ) -> Self {
        let ring_cfg = RingConfig::new(inbound_ring_capacity.trailing_zeros() as u8, 1, false);
        let write_slab = AlignedSlab::new(write_slab_size);

        Self {
            fd: std::cell::Cell::new(fd),
            reactor_id,
            generation: AtomicU64::new(0),
            reactor,
            ring: Ring::new(ring_cfg),
            pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_error: std::sync::atomic::AtomicU8::new(0),
            read_waiter: Suspend::new(),
            write_slab,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            flush_in_progress: AtomicBool::new(false),
            send_inflight: std::cell::Cell::new(false),
            flush_waiter: Suspend::new(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.get()
    }

    pub fn reactor_id(&self) -> usize {
        self.reactor_id
    }

    /// Binds a pooled connection to a freshly accepted descriptor. Only
    /// valid while the connection sits in the reactor's free pool.
    pub fn rebind(&self, fd: RawFd) {
        self.fd.set(fd);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------
    // Handler-facing operations
    // -----------------------------------------------------------------

    /// Returns a `ReadSnapshot`, suspending if nothing is available yet.
    /// Cancellable through `cancel`: on cancellation the waiter is released
    /// with a [`ErrorCode::Cancelled`] result instead of hanging forever.
    pub async fn read_async(&self, cancel: &CancelToken) -> Result<ReadSnapshot, ContractViolation> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(ReadSnapshot::closed(error_code_from_u8(
                self.close_error.load(Ordering::Acquire),
            )));
        }
        if self.pending.swap(false, Ordering::AcqRel) {
            return Ok(ReadSnapshot {
                tail: self.ring.snapshot_tail(),
                closed: false,
                error_code: ErrorCode::None,
            });
        }
        if !self.ring.is_empty() {
            return Ok(ReadSnapshot {
                tail: self.ring.snapshot_tail(),
                closed: false,
                error_code: ErrorCode::None,
            });
        }

        if !self.read_waiter.try_arm() {
            return Err(ContractViolation::DoubleReader);
        }

        // A producer's enqueue_ring_item/mark_closed may have run its
        // signal_if_armed in the window between the checks above and
        // arming just now, found no armed waiter, and fallen back to
        // `pending`/`closed` — re-check before actually suspending so that
        // race doesn't strand us on `wait()` forever.
        if self.pending.swap(false, Ordering::AcqRel) || !self.ring.is_empty() {
            self.read_waiter.disarm();
            return Ok(ReadSnapshot {
                tail: self.ring.snapshot_tail(),
                closed: false,
                error_code: ErrorCode::None,
            });
        }

        let generation = self.generation.load(Ordering::Acquire);

        let snapshot = tokio::select! {
            snapshot = self.read_waiter.wait() => snapshot,
            () = cancel.cancelled() => {
                self.read_waiter.disarm();
                return Ok(ReadSnapshot::closed(ErrorCode::Cancelled));
            }
        };

        if self.generation.load(Ordering::Acquire) != generation {
            return Ok(ReadSnapshot::closed(ErrorCode::StaleGeneration));
        }
        Ok(snapshot)
    }

    /// Clears the suspension primitive for reuse.
    pub fn reset_read(&self) {
        self.read_waiter.disarm();
    }

    /// Drains a single item strictly below `snapshot`.
    pub fn try_get_ring(&self, snapshot: u64) -> Option<RingItem> {
        self.ring.try_dequeue_until(snapshot)
    }

    /// Drains every item strictly below `snapshot`.
    pub fn try_get_ring_batch(&self, snapshot: u64, out: &mut Vec<RingItem>) -> usize {
        let mut n = 0;
        while let Some(item) = self.ring.try_dequeue_until(snapshot) {
            out.push(item);
            n += 1;
        }
        n
    }

    /// Returns a buffer id to the owning reactor. Safe from any thread.
    pub fn return_ring(&self, buffer_id: u16) {
        self.reactor.return_queue.enqueue_spin(buffer_id);
    }

    /// Copies `bytes` into the write slab at the current tail.
    pub fn write(&self, bytes: &[u8]) -> Result<(), WriteError> {
        let span = self.get_span(bytes.len())?;
        span.copy_from_slice(bytes);
        self.advance(bytes.len())?;
        Ok(())
    }

    /// Returns a mutable span of up to `hint` bytes starting at the current
    /// tail. Pair with [`Connection::advance`] once the bytes are written.
    ///
    /// Takes `&self` rather than `&mut self` because `Connection` is shared
    /// via `Arc` across the handler and reactor; the handler is the slab's
    /// sole writer by contract (§5), so aliasing the returned mutable slice
    /// against other `&self` methods here is never actually concurrent.
    #[allow(clippy::mut_from_ref)]
    pub fn get_span(&self, hint: usize) -> Result<&mut [u8], WriteError> {
        if self.flush_in_progress.load(Ordering::Acquire) {
            return Err(ContractViolation::WriteDuringFlush.into());
        }
        let tail = self.tail.load(Ordering::Relaxed);
        let capacity = self.write_slab.len();
        let available = capacity - tail;
        if available == 0 {
            return Err(InsufficientSpace { requested: hint, available }.into());
        }
        let len = hint.min(available);
        // SAFETY: [tail, tail+len) is the handler's exclusive write region;
        // the reactor only ever reads [head, in_flight), and in_flight <= tail.
        let ptr = self.write_slab[tail].get();
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }

    /// Commits `n` bytes written via [`Connection::get_span`].
    pub fn advance(&self, n: usize) -> Result<(), ContractViolation> {
        let tail = self.tail.load(Ordering::Relaxed);
        let capacity = self.write_slab.len();
        if tail + n > capacity {
            return Err(ContractViolation::AdvanceBeyondSlab { requested: tail + n, capacity });
        }
        self.tail.store(tail + n, Ordering::Release);
        Ok(())
    }

    /// Flushes `[head, tail)`, completing immediately if there's nothing to send.
    /// Cancellable through `cancel`: on cancellation the waiter is released
    /// with a closed result, but `flush_in_progress` is left set since the
    /// physical send is still outstanding — its eventual completion resets it.
    pub async fn flush_async(&self, cancel: &CancelToken) -> Result<FlushResult, ContractViolation> {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return Ok(FlushResult { closed: false, error_code: ErrorCode::None });
        }

        if self
            .flush_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ContractViolation::DoubleFlush);
        }
        if !self.flush_waiter.try_arm() {
            self.flush_in_progress.store(false, Ordering::Release);
            return Err(ContractViolation::DoubleFlush);
        }

        self.in_flight.store(tail, Ordering::Release);
        self.reactor.flush_queue.enqueue_spin(self.fd.get());

        tokio::select! {
            result = self.flush_waiter.wait() => Ok(result),
            () = cancel.cancelled() => {
                self.flush_waiter.disarm();
                Ok(FlushResult { closed: true, error_code: ErrorCode::Cancelled })
            }
        }
    }

    /// Resets generation, marks closed, releases waiters, resets slab and
    /// ring state. Used by the pooling path when recycling a Connection.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.mark_closed(ErrorCode::None);
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.in_flight.store(0, Ordering::Relaxed);
        self.flush_in_progress.store(false, Ordering::Relaxed);
        self.send_inflight.set(false);
        self.pending.store(false, Ordering::Relaxed);
        self.closed.store(false, Ordering::Relaxed);
        self.ring.clear();
        self.read_waiter.disarm();
    }

    /// Like [`Connection::clear`], but skips releasing waiters through a
    /// signal — used when the caller has already drained outstanding
    /// completions. A waiter can still be armed here (cancellation dropped
    /// its future without a signal ever arriving), so the suspension
    /// primitives are reset directly rather than assumed idle.
    pub fn fast_clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.in_flight.store(0, Ordering::Relaxed);
        self.flush_in_progress.store(false, Ordering::Relaxed);
        self.send_inflight.set(false);
        self.pending.store(false, Ordering::Relaxed);
        self.closed.store(false, Ordering::Relaxed);
        self.ring.clear();
        self.read_waiter.disarm();
        self.flush_waiter.disarm();
    }

    // -----------------------------------------------------------------
    // Reactor-facing (producer side) operations
    // -----------------------------------------------------------------

    /// Enqueues a received chunk. If the ring is full, marks the connection
    /// closed; otherwise signals an armed reader or sets `pending`.
    pub fn enqueue_ring_item(&self, ptr: *const u8, len: usize, buffer_id: u16) {
        let item = RingItem { ptr, len, buffer_id };
        if !self.ring.push(item) {
            self.mark_closed(ErrorCode::RingFull);
            return;
        }

        let snapshot = ReadSnapshot {
            tail: self.ring.snapshot_tail(),
            closed: false,
            error_code: ErrorCode::None,
        };
        if self.read_waiter.signal_if_armed(snapshot).is_err() {
            self.pending.store(true, Ordering::Release);
        }
    }

    /// Marks the connection closed with `error_code`, releasing any
    /// suspended read/flush waiters with a closed result.
    pub fn mark_closed(&self, error_code: ErrorCode) {
        self.closed.store(true, Ordering::Release);
        self.close_error.store(error_code_to_u8(error_code), Ordering::Release);

        let read_snapshot = ReadSnapshot::closed(error_code);
        let _ = self.read_waiter.signal_if_armed(read_snapshot);
        let flush_result = FlushResult { closed: true, error_code };
        let _ = self.flush_waiter.signal_if_armed(flush_result);
    }

    /// Resets write-slab progress and signals the flush waiter.
    pub fn complete_flush(&self) {
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
        self.in_flight.store(0, Ordering::Release);
        self.flush_in_progress.store(false, Ordering::Release);

        let result = FlushResult { closed: false, error_code: ErrorCode::None };
        let _ = self.flush_waiter.signal_if_armed(result);
    }

    /// Reactor-side: the `[head, in_flight)` span still to be sent.
    pub fn pending_send_span(&self) -> (*const u8, usize) {
        let head = self.head.load(Ordering::Acquire);
        let in_flight = self.in_flight.load(Ordering::Acquire);
        let ptr = self.write_slab[head].get().cast_const();
        (ptr, in_flight - head)
    }

    pub fn advance_send_head(&self, n: usize) {
        self.head.fetch_add(n, Ordering::AcqRel);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn head(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    pub fn send_inflight(&self) -> bool {
        self.send_inflight.get()
    }

    pub fn set_send_inflight(&self, v: bool) {
        self.send_inflight.set(v);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Return value intentionally ignored: on Linux, close() after EINTR still
        // closes the fd (retrying causes double-close); neither case is worth
        // panicking over in a destructor.
        unsafe { libc::close(self.fd.get()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection() -> Connection {
        Connection::new(
            -1,
            0,
            ReactorHandle {
                return_queue: Arc::new(vyukov::Queue::new(16)),
                flush_queue: Arc::new(mpsc_ring::Ring::new(16)),
            },
            8,
            256,
        )
    }

    #[test]
    fn write_and_flush_roundtrip() {
        let conn = test_connection();
        conn.write(b"hello").unwrap();
        conn.in_flight.store(5, Ordering::Relaxed);
        assert_eq!(conn.pending_send_span().1, 5);
    }

    #[test]
    fn write_rejected_during_flush() {
        let conn = test_connection();
        conn.write(b"hi").unwrap();
        conn.flush_in_progress.store(true, Ordering::Release);
        assert_eq!(conn.write(b"more"), Err(ContractViolation::WriteDuringFlush.into()));
    }

    #[test]
    fn advance_beyond_slab_is_rejected() {
        let conn = test_connection();
        assert!(conn.advance(1000).is_err());
    }

    #[test]
    fn complete_flush_resets_positions() {
        let conn = test_connection();
        conn.write(b"abc").unwrap();
        conn.in_flight.store(3, Ordering::Relaxed);
        conn.flush_in_progress.store(true, Ordering::Relaxed);
        conn.complete_flush();
        assert_eq!(conn.head(), 0);
        assert_eq!(conn.in_flight(), 0);
        assert!(!conn.flush_in_progress.load(Ordering::Relaxed));
    }

    #[test]
    fn clear_bumps_generation_and_resets_ring() {
        let conn = test_connection();
        let g0 = conn.generation();
        conn.enqueue_ring_item(std::ptr::null(), 0, 0);
        conn.clear();
        assert_eq!(conn.generation(), g0 + 1);
        assert!(conn.ring.is_empty());
    }

    #[tokio::test]
    async fn pending_makes_next_read_immediate() {
        let conn = test_connection();
        let cancel = CancelToken::new();
        conn.enqueue_ring_item(std::ptr::null(), 4, 0);
        let snapshot = conn.read_async(&cancel).await.unwrap();
        assert!(!snapshot.closed);
        assert_eq!(snapshot.tail, 1);
    }

    #[tokio::test]
    async fn partial_drain_leaves_remainder_for_next_cycle() {
        let conn = test_connection();
        let cancel = CancelToken::new();
        conn.enqueue_ring_item(std::ptr::null(), 5, 0);
        conn.enqueue_ring_item(std::ptr::null(), 5, 1);

        let snapshot = conn.read_async(&cancel).await.unwrap();
        assert_eq!(snapshot.tail, 2);

        // Consume only the first item, not the whole snapshot.
        let first = conn.try_get_ring(snapshot.tail).unwrap();
        assert_eq!(first.buffer_id, 0);
        conn.reset_read();

        // No new completion has arrived, but the second item was already
        // enqueued below the prior snapshot's tail — the next cycle must
        // see it without a fresh kernel receive.
        let next = conn.read_async(&cancel).await.unwrap();
        assert!(!next.closed);
        let second = conn.try_get_ring(next.tail).unwrap();
        assert_eq!(second.buffer_id, 1);
        assert!(conn.try_get_ring(next.tail).is_none());
    }

    #[tokio::test]
    async fn mark_closed_wakes_armed_reader() {
        let conn = Arc::new(test_connection());
        let c2 = Arc::clone(&conn);
        let handle = tokio::spawn(async move {
            let cancel = CancelToken::new();
            c2.read_async(&cancel).await
        });
        tokio::task::yield_now().await;
        conn.mark_closed(ErrorCode::Eof);
        let snapshot = handle.await.unwrap().unwrap();
        assert!(snapshot.closed);
        assert_eq!(snapshot.error_code, ErrorCode::Eof);
    }

    #[tokio::test]
    async fn cancelling_read_releases_armed_waiter() {
        let conn = Arc::new(test_connection());
        let cancel = CancelToken::new();
        let c2 = Arc::clone(&conn);
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move { c2.read_async(&cancel2).await });
        tokio::task::yield_now().await;
        cancel.cancel();
        let snapshot = handle.await.unwrap().unwrap();
        assert!(snapshot.closed);
        assert_eq!(snapshot.error_code, ErrorCode::Cancelled);

        // The waiter must have been released, not left armed.
        conn.enqueue_ring_item(std::ptr::null(), 4, 0);
        let fresh_cancel = CancelToken::new();
        let next = conn.read_async(&fresh_cancel).await.unwrap();
        assert!(!next.closed);
    }
}
