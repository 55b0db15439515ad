//! Thin wrapper narrowing the `io-uring` crate down to exactly the
//! operations the design calls for: ring setup flags, provided-buffer ring
//! register/free, multishot accept/receive, plain send, user-data tagging,
//! submit/peek/advance/wait, and completion introspection. Nothing above
//! this module imports `io_uring` directly.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use io_uring::{cqueue, opcode, squeue, types, IoUring};

/// Kind tag packed into the upper 32 bits of a completion's user-data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpKind {
    Accept = 0,
    Receive = 1,
    Send = 2,
    Cancel = 3,
}

impl OpKind {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => OpKind::Accept,
            1 => OpKind::Receive,
            2 => OpKind::Send,
            _ => OpKind::Cancel,
        }
    }
}

/// Packs a kind tag and a descriptor into the 64-bit user-data field so the
/// reactor's dispatcher can classify a completion with a single load.
pub fn encode_user_data(kind: OpKind, descriptor: RawFd) -> u64 {
    ((kind as u64) << 32) | (descriptor as u32 as u64)
}

pub fn decode_user_data(user_data: u64) -> (OpKind, RawFd) {
    (OpKind::from_u32((user_data >> 32) as u32), (user_data as u32) as RawFd)
}

pub struct CompletionEvent {
    pub user_data: u64,
    pub result: i32,
    pub flags: u32,
}

impl CompletionEvent {
    /// Whether the kernel will deliver further completions for this same
    /// submitted entry (multishot accept/receive).
    pub fn has_more(&self) -> bool {
        cqueue::more(self.flags)
    }

    /// Extracts the provided-buffer id a receive completion was satisfied
    /// from, if any.
    pub fn buffer_id(&self) -> Option<u16> {
        cqueue::buffer_select(self.flags)
    }
}

/// Setup flags for a ring, named the way the design's configuration structs
/// name them rather than by raw kernel constant.
#[derive(Debug, Clone, Copy)]
pub struct RingSetup {
    pub single_submitter: bool,
    pub deferred_taskrun: bool,
    pub sq_entries: u32,
    pub cq_entries: u32,
    /// `IORING_SETUP_SQPOLL` idle timeout; `None` disables kernel-poll mode.
    pub kernel_poll_idle_ms: Option<u32>,
    /// Pin the SQPOLL kernel thread to a CPU. Ignored if `kernel_poll_idle_ms` is `None`.
    pub kernel_poll_cpu: Option<u32>,
}

pub struct KernelRing {
    inner: IoUring,
}

impl KernelRing {
    pub fn new(setup: RingSetup) -> io::Result<Self> {
        let mut builder = IoUring::builder();
        builder.setup_cqsize(setup.cq_entries);
        if setup.single_submitter {
            builder.setup_single_issuer();
        }
        if setup.deferred_taskrun {
            builder.setup_coop_taskrun().setup_defer_taskrun();
        }
        if let Some(idle) = setup.kernel_poll_idle_ms {
            builder.setup_sqpoll(idle);
            if let Some(cpu) = setup.kernel_poll_cpu {
                builder.setup_sqpoll_cpu(cpu);
            }
        }
        let inner = builder.build(setup.sq_entries)?;
        Ok(Self { inner })
    }

    /// Registers a provided-buffer ring built by [`crate::bufring::BufferRingSlab`].
    ///
    /// # Safety
    /// `addr` must point to a `count`-entry array of `io_uring::types::BufRingEntry`
    /// valid for the lifetime of the registration.
    pub unsafe fn register_buf_ring(&self, addr: u64, count: u16, group_id: u16) -> io::Result<()> {
        self.inner.submitter().register_buf_ring(addr, count, group_id)
    }

    /// Unregisters a provided-buffer ring. Call before dropping the
    /// [`crate::bufring::BufferRingSlab`] it was built from.
    pub fn unregister_buf_ring(&self, group_id: u16) -> io::Result<()> {
        self.inner.submitter().unregister_buf_ring(group_id)
    }

    /// Pushes an entry, retrying a single submit-and-flush if the submission
    /// queue is momentarily full, then spinning — mirrors the corpus's
    /// `push_entry` helper.
    ///
    /// # Safety
    /// `entry` must reference buffers valid for the duration of the operation.
    unsafe fn push(&mut self, entry: &squeue::Entry) {
        loop {
            if self.inner.submission().push(entry).is_ok() {
                return;
            }
            let _ = self.inner.submit();
            if self.inner.submission().push(entry).is_ok() {
                return;
            }
            std::hint::spin_loop();
        }
    }

    /// Arms a multishot accept on `listen_fd`.
    pub fn push_accept_multi(&mut self, listen_fd: RawFd) {
        let entry = opcode::AcceptMulti::new(types::Fd(listen_fd))
            .build()
            .user_data(encode_user_data(OpKind::Accept, 0));
        // SAFETY: no user buffers referenced by this entry.
        unsafe { self.push(&entry) };
    }

    /// Arms a multishot receive on `fd`, selecting from buffer group `group_id`.
    pub fn push_recv_multi(&mut self, fd: RawFd, group_id: u16) {
        let entry = opcode::RecvMulti::new(types::Fd(fd), group_id)
            .build()
            .user_data(encode_user_data(OpKind::Receive, fd));
        // SAFETY: the kernel selects the receive buffer itself; no caller buffer involved.
        unsafe { self.push(&entry) };
    }

    /// Submits a send of `len` bytes starting at `ptr` for `fd`.
    ///
    /// # Safety
    /// `ptr` must stay valid and unmoved ([head, in_flight) of the
    /// connection's write slab) until the completion for this `fd`/Send pair
    /// arrives.
    pub unsafe fn push_send(&mut self, fd: RawFd, ptr: *const u8, len: u32) {
        let entry = opcode::Send::new(types::Fd(fd), ptr, len)
            .build()
            .user_data(encode_user_data(OpKind::Send, fd));
        self.push(&entry);
    }

    pub fn submit(&mut self) -> io::Result<usize> {
        self.inner.submit()
    }

    pub fn submit_and_wait_timeout(&mut self, want: usize, timeout: Duration) -> io::Result<usize> {
        let ts = types::Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        let args = types::SubmitArgs::new().timespec(&ts);
        match self.inner.submitter().submit_with_args(want, &args) {
            Ok(n) => Ok(n),
            // ETIME: the wait timed out with no completions — a no-op continue.
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Drains up to `max` completions, collecting eagerly so the borrow on
    /// the completion queue is released before any further submissions.
    pub fn drain_completions(&mut self, max: usize) -> Vec<CompletionEvent> {
        self.inner
            .completion()
            .take(max)
            .map(|cqe| CompletionEvent {
                user_data: cqe.user_data(),
                result: cqe.result(),
                flags: cqe.flags(),
            })
            .collect()
    }
}
