//! The single thread that owns the listening socket and a dedicated kernel
//! ring on which it arms a multishot-accept operation. Every accepted
//! descriptor gets `TCP_NODELAY` and is dispatched round-robin to one of
//! the reactor accept queues.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{AcceptorConfig, IpFamily};
use crate::error::ConstructionError;
use crate::kernel::{decode_user_data, KernelRing, OpKind, RingSetup};

fn create_listener(bind_address: IpAddr, port: u16, backlog: i32, family: IpFamily) -> io::Result<Socket> {
    let domain = match bind_address {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if domain == Domain::IPV6 && family == IpFamily::DualStackV6 {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(bind_address, port).into())?;
    socket.listen(backlog)?;
    Ok(socket)
}

pub struct Acceptor {
    listener: Socket,
    reactor_queues: Vec<mpsc::UnboundedSender<RawFd>>,
    next_reactor: usize,
    config: AcceptorConfig,
    running: Arc<AtomicBool>,
}

impl Acceptor {
    /// Binds and listens, but does not touch the kernel ring —
    /// `IORING_SETUP_SINGLE_ISSUER` binds a ring to whichever task first
    /// drives it, so the ring itself is built inside [`Acceptor::run`] on the
    /// thread that will own it. Callers that need construction failures
    /// surfaced synchronously should wait on the `ready` channel passed to
    /// `run`.
    pub fn new(
        bind_address: IpAddr,
        port: u16,
        backlog: i32,
        reactor_queues: Vec<mpsc::UnboundedSender<RawFd>>,
        config: AcceptorConfig,
        running: Arc<AtomicBool>,
    ) -> Result<Self, ConstructionError> {
        let listener = create_listener(bind_address, port, backlog, config.ip_family)
            .map_err(ConstructionError::Listen)?;

        Ok(Self {
            listener,
            reactor_queues,
            next_reactor: 0,
            config,
            running,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr().map(|a| a.as_socket().expect("AF_INET/AF_INET6"))
    }

    /// Builds the kernel ring on the calling thread, reports the outcome on
    /// `ready`, then drives the accept loop until `running` clears. Must be
    /// called from the thread meant to own this acceptor for its whole life.
    pub fn run(mut self, ready: Sender<Result<(), ConstructionError>>) {
        let mut ring = match KernelRing::new(RingSetup {
            single_submitter: self.config.single_submitter,
            deferred_taskrun: false,
            sq_entries: self.config.queue_size,
            cq_entries: self.config.queue_size,
            kernel_poll_idle_ms: self.config.kernel_poll_cpu.map(|_| self.config.kernel_poll_idle_ms),
            kernel_poll_cpu: self.config.kernel_poll_cpu,
        }) {
            Ok(ring) => ring,
            Err(e) => {
                let _ = ready.send(Err(ConstructionError::RingSetup(e)));
                return;
            }
        };

        if ready.send(Ok(())).is_err() {
            return;
        }

        ring.push_accept_multi(self.listener.as_raw_fd());
        if let Err(e) = ring.submit() {
            warn!(error = %e, "failed to submit initial multishot accept");
        }

        while self.running.load(Ordering::Acquire) {
            let events = ring.drain_completions(self.config.accept_batch_size);
            for event in &events {
                let (kind, _) = decode_user_data(event.user_data);
                if kind != OpKind::Accept {
                    continue;
                }
                if event.result < 0 {
                    warn!(error = event.result, "accept completion reported an error");
                    continue;
                }
                self.dispatch(event.result as RawFd);
                if !event.has_more() {
                    // Multishot accept stopped delivering completions
                    // (e.g. listener error); re-arm it.
                    ring.push_accept_multi(self.listener.as_raw_fd());
                }
            }

            if let Err(e) = ring.submit_and_wait_timeout(1, self.config.wait_timeout) {
                warn!(error = %e, "acceptor submit_and_wait failed");
            }
        }

        debug!("acceptor shut down");
    }

    fn dispatch(&mut self, fd: RawFd) {
        // SAFETY: `fd` is a freshly accepted, valid, not-yet-owned stream
        // socket. Wrapping it borrows `set_nodelay`; `mem::forget` hands raw
        // ownership on to the reactor's `Connection` map instead of letting
        // this temporary `Socket`'s `Drop` close it.
        let socket = unsafe { socket2::Socket::from_raw_fd(fd) };
        if let Err(e) = socket.set_nodelay(true) {
            warn!(fd, error = %e, "failed to set TCP_NODELAY");
        }
        std::mem::forget(socket);

        if self.reactor_queues.is_empty() {
            unsafe { libc::close(fd) };
            return;
        }
        let idx = self.next_reactor;
        self.next_reactor = (self.next_reactor + 1) % self.reactor_queues.len();
        if self.reactor_queues[idx].send(fd).is_err() {
            unsafe { libc::close(fd) };
        }
    }
}
