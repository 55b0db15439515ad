//! One reactor per OS thread: owns a kernel ring, a buffer-ring slab, and a
//! descriptor-to-`Connection` map. A single loop iteration drains newly
//! accepted descriptors, drains the buffer-return and flush-request queues
//! fed by handler tasks, processes a bounded batch of completions, then
//! submits and waits with a timeout.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use ring_queues::{mpsc_ring, vyukov};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::bufring::BufferRingSlab;
use crate::config::ReactorConfig;
use crate::connection::{Connection, ReactorHandle};
use crate::error::{ConstructionError, ErrorCode};
use crate::kernel::{decode_user_data, CompletionEvent, KernelRing, OpKind, RingSetup};

/// Everything a freshly accepted connection is published through, back to
/// the [`crate::engine::Engine`] façade that `accept_async` drains.
pub type AcceptPublisher = mpsc::UnboundedSender<Arc<Connection>>;

pub struct Reactor {
    id: usize,
    conns: HashMap<RawFd, Arc<Connection>>,
    /// Connections torn down and not referenced elsewhere, kept for reuse —
    /// the "or allocates one" half of the pool-or-allocate creation path.
    pool: Vec<Arc<Connection>>,
    accept_rx: mpsc::UnboundedReceiver<RawFd>,
    publish_tx: AcceptPublisher,
    return_queue: Arc<vyukov::Queue<u16>>,
    flush_queue: Arc<mpsc_ring::Ring<RawFd>>,
    config: ReactorConfig,
    running: Arc<AtomicBool>,
}

impl Reactor {
    /// Validates config and wires up the queues a connection reaches the
    /// reactor through. Does not touch the kernel — `IORING_SETUP_SINGLE_ISSUER`
    /// binds a ring to whichever task first drives it, so the ring itself is
    /// built inside [`Reactor::run`] on the thread that will own it; callers
    /// that need construction failures surfaced synchronously should wait on
    /// the `ready` channel passed to `run`.
    pub fn new(
        id: usize,
        config: ReactorConfig,
        accept_rx: mpsc::UnboundedReceiver<RawFd>,
        publish_tx: AcceptPublisher,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            conns: HashMap::with_capacity(config.max_connections),
            pool: Vec::new(),
            accept_rx,
            publish_tx,
            return_queue: Arc::new(vyukov::Queue::new(config.return_queue_capacity)),
            flush_queue: Arc::new(mpsc_ring::Ring::new(config.flush_queue_capacity)),
            config,
            running,
        }
    }

    /// Returns the queues a [`Connection`] uses to reach back into this
    /// reactor. Non-owning: the reactor holds `Connection`s via its map;
    /// connections only ever hold these shared queue handles in return.
    fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            return_queue: Arc::clone(&self.return_queue),
            flush_queue: Arc::clone(&self.flush_queue),
        }
    }

    /// Builds the kernel ring and buffer-ring slab on the calling thread,
    /// reports the outcome on `ready`, then drives the loop until `running`
    /// clears. Must be called from the thread meant to own this reactor for
    /// its whole life.
    pub fn run(mut self, ready: Sender<Result<(), ConstructionError>>) {
        let mut ring = match KernelRing::new(RingSetup {
            single_submitter: self.config.single_submitter,
            deferred_taskrun: self.config.deferred_taskrun,
            sq_entries: self.config.submission_queue_size,
            cq_entries: self.config.completion_queue_size,
            kernel_poll_idle_ms: self.config.kernel_poll_cpu.map(|_| self.config.kernel_poll_idle_ms),
            kernel_poll_cpu: self.config.kernel_poll_cpu,
        }) {
            Ok(ring) => ring,
            Err(e) => {
                let _ = ready.send(Err(ConstructionError::RingSetup(e)));
                return;
            }
        };

        let group_id = self.id as u16;
        let mut bufring = match BufferRingSlab::new(
            self.config.buffer_ring_entries,
            self.config.recv_buffer_size,
            group_id,
            self.config.incremental_buffer_consumption,
        ) {
            Ok(bufring) => bufring,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };

        let (addr, count) = bufring.ring_ptr_and_count();
        // SAFETY: addr/count describe the slab just allocated above, kept
        // alive for this reactor's entire life (it only drops after this
        // ring is unregistered in `shutdown`).
        if let Err(e) = unsafe { ring.register_buf_ring(addr, count, group_id) } {
            let _ = ready.send(Err(ConstructionError::BufferRingRegister(e)));
            return;
        }

        if ready.send(Ok(())).is_err() {
            return;
        }

        while self.running.load(Ordering::Acquire) {
            self.drain_new_descriptors(&mut ring, &bufring);
            self.drain_buffer_returns(&mut bufring);
            self.drain_flush_requests(&mut ring);
            self.process_completions(&mut ring, &mut bufring);
            if let Err(e) = ring.submit_and_wait_timeout(1, self.config.completion_wait_timeout) {
                error!(reactor = self.id, error = %e, "submit_and_wait failed");
            }
        }
        self.shutdown(&mut ring, &bufring);
    }

    fn drain_new_descriptors(&mut self, ring: &mut KernelRing, bufring: &BufferRingSlab) {
        while let Ok(fd) = self.accept_rx.try_recv() {
            if self.conns.len() >= self.config.max_connections {
                warn!(reactor = self.id, fd, "max_connections reached, dropping accept");
                unsafe { libc::close(fd) };
                continue;
            }

            let conn = match self.pool.pop() {
                Some(conn) => {
                    conn.rebind(fd);
                    conn
                }
                None => Arc::new(Connection::new(
                    fd,
                    self.id,
                    self.handle(),
                    self.config.inbound_ring_capacity,
                    self.config.write_slab_size,
                )),
            };

            ring.push_recv_multi(fd, bufring.group_id());
            self.conns.insert(fd, Arc::clone(&conn));
            if self.publish_tx.send(conn).is_err() {
                debug!(reactor = self.id, "accept channel closed, engine shutting down");
            }
        }
    }

    fn drain_buffer_returns(&mut self, bufring: &mut BufferRingSlab) {
        let mut republished = false;
        self.return_queue.drain(|buffer_id| {
            if bufring.on_return(buffer_id) {
                bufring.add(buffer_id);
                republished = true;
            }
        });
        if republished {
            bufring.publish();
        }
    }

    fn drain_flush_requests(&mut self, ring: &mut KernelRing) {
        let snapshot = self.flush_queue.snapshot_tail();
        let conns = &self.conns;
        self.flush_queue.drain_until(snapshot, |fd| {
            let Some(conn) = conns.get(&fd) else { return };
            if conn.send_inflight() {
                return;
            }
            let (ptr, len) = conn.pending_send_span();
            if len == 0 {
                conn.complete_flush();
                return;
            }
            conn.set_send_inflight(true);
            // SAFETY: [ptr, ptr+len) is [head, in_flight) of this
            // connection's write slab; `write` is rejected while a flush is
            // in progress, so nothing moves it before the send completes.
            unsafe { ring.push_send(fd, ptr, len as u32) };
        });
    }

    fn process_completions(&mut self, ring: &mut KernelRing, bufring: &mut BufferRingSlab) {
        for event in ring.drain_completions(self.config.completion_batch_size) {
            let (kind, fd) = decode_user_data(event.user_data);
            match kind {
                // The acceptor owns its own ring; an Accept tag never
                // appears on a reactor's completion queue.
                OpKind::Accept => {}
                OpKind::Receive => self.handle_receive(ring, bufring, fd, &event),
                OpKind::Send => self.handle_send(ring, fd, &event),
                OpKind::Cancel => {}
            }
        }
    }

    fn handle_receive(
        &mut self,
        ring: &mut KernelRing,
        bufring: &mut BufferRingSlab,
        fd: RawFd,
        event: &CompletionEvent,
    ) {
        if event.result <= 0 {
            if let Some(buffer_id) = event.buffer_id() {
                Self::republish_if_free(bufring, buffer_id);
            }
            let code = if event.result == 0 { ErrorCode::Eof } else { ErrorCode::ReceiveFailed };
            self.teardown(fd, code);
            return;
        }

        let Some(buffer_id) = event.buffer_id() else {
            warn!(reactor = self.id, fd, "receive completion carried no buffer id");
            return;
        };
        let terminal = !event.has_more();
        let (ptr, len) = bufring.chunk_for_completion(buffer_id, event.result as u32, terminal);

        match self.conns.get(&fd) {
            Some(conn) => conn.enqueue_ring_item(ptr, len, buffer_id),
            None => {
                // Race with teardown: the completion outlived the
                // connection. Return the buffer directly so it isn't leaked.
                Self::republish_if_free(bufring, buffer_id);
            }
        }

        if terminal {
            ring.push_recv_multi(fd, bufring.group_id());
        }
    }

    fn handle_send(&mut self, ring: &mut KernelRing, fd: RawFd, event: &CompletionEvent) {
        let Some(conn) = self.conns.get(&fd).cloned() else { return };
        conn.set_send_inflight(false);
        if event.result <= 0 {
            self.teardown(fd, ErrorCode::SendFailed);
            return;
        }
        conn.advance_send_head(event.result as usize);
        if conn.head() < conn.in_flight() {
            let (ptr, len) = conn.pending_send_span();
            conn.set_send_inflight(true);
            // SAFETY: see `drain_flush_requests` — same [head, in_flight) span.
            unsafe { ring.push_send(fd, ptr, len as u32) };
        } else {
            conn.complete_flush();
        }
    }

    fn republish_if_free(bufring: &mut BufferRingSlab, buffer_id: u16) {
        if bufring.on_return(buffer_id) {
            bufring.add(buffer_id);
            bufring.publish();
        }
    }

    fn teardown(&mut self, fd: RawFd, error_code: ErrorCode) {
        let Some(conn) = self.conns.remove(&fd) else { return };
        conn.mark_closed(error_code);
        unsafe { libc::close(fd) };
        // Marks the fd dead so a later `Drop` (if this connection escapes
        // the pool while still held by a stale handler `Arc`) doesn't
        // double-close a descriptor the kernel may have already reused.
        conn.rebind(-1);
        // Only reclaim into the pool (and reset `closed`/ring state for
        // reuse) if nothing else still holds this connection — otherwise a
        // handler waiting on the `closed` result we just set, or data
        // already enqueued before this teardown, would be wiped out from
        // under it.
        if Arc::strong_count(&conn) == 1 {
            conn.fast_clear();
            self.pool.push(conn);
        }
    }

    fn shutdown(&mut self, ring: &mut KernelRing, bufring: &BufferRingSlab) {
        let fds: Vec<RawFd> = self.conns.keys().copied().collect();
        for fd in fds {
            self.teardown(fd, ErrorCode::None);
        }
        if let Err(e) = ring.unregister_buf_ring(bufring.group_id()) {
            warn!(reactor = self.id, error = %e, "failed to unregister buffer ring");
        }
        debug!(reactor = self.id, "reactor shut down");
    }
}
