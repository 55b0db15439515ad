//! Configuration structs, enumerating exactly the fields named in the
//! external-interfaces section of the design: nothing here is load-bearing
//! beyond what's listed there.

use std::net::IpAddr;
use std::time::Duration;

/// Which IP family the acceptor's listening socket serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    /// Dual-stack IPv6 with `IPV6_V6ONLY` turned off.
    DualStackV6,
}

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// `IORING_SETUP_SINGLE_ISSUER`.
    pub single_submitter: bool,
    /// `IORING_SETUP_DEFER_TASKRUN` / coop-taskrun style deferred completion work.
    pub deferred_taskrun: bool,
    /// `Some(cpu)` enables `IORING_SETUP_SQPOLL` pinned to that CPU; `None`
    /// leaves kernel-poll mode off.
    pub kernel_poll_cpu: Option<u32>,
    pub kernel_poll_idle_ms: u32,
    pub submission_queue_size: u32,
    pub completion_queue_size: u32,
    pub recv_buffer_size: usize,
    /// Power-of-two number of slab entries registered as the buffer ring.
    pub buffer_ring_entries: usize,
    pub completion_batch_size: usize,
    pub max_connections: usize,
    pub completion_wait_timeout: Duration,
    pub incremental_buffer_consumption: bool,
    /// Power-of-two capacity of each connection's inbound SPSC ring.
    pub inbound_ring_capacity: usize,
    /// Size in bytes of each connection's write slab (64-byte aligned).
    pub write_slab_size: usize,
    /// Capacity of the buffer-return and flush-request MPSC queues.
    pub return_queue_capacity: usize,
    pub flush_queue_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            single_submitter: true,
            deferred_taskrun: true,
            kernel_poll_cpu: None,
            kernel_poll_idle_ms: 1000,
            submission_queue_size: 4096,
            completion_queue_size: 8192,
            recv_buffer_size: 4096,
            buffer_ring_entries: 4096,
            completion_batch_size: 4096,
            max_connections: 65536,
            completion_wait_timeout: Duration::from_millis(10),
            incremental_buffer_consumption: false,
            inbound_ring_capacity: 1024,
            write_slab_size: 16 * 1024,
            return_queue_capacity: 4096,
            flush_queue_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    pub single_submitter: bool,
    pub kernel_poll_cpu: Option<u32>,
    pub kernel_poll_idle_ms: u32,
    pub queue_size: u32,
    pub accept_batch_size: usize,
    pub wait_timeout: Duration,
    pub ip_family: IpFamily,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            single_submitter: true,
            kernel_poll_cpu: None,
            kernel_poll_idle_ms: 1000,
            queue_size: 256,
            accept_batch_size: 256,
            wait_timeout: Duration::from_millis(100),
            ip_family: IpFamily::V4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub listen_backlog: i32,
    pub reactor_count: usize,
    pub acceptor: AcceptorConfig,
    /// One config per reactor. Must have `reactor_count` entries; use
    /// [`EngineConfig::uniform`] to build this from a single template.
    pub reactors: Vec<ReactorConfig>,
}

impl EngineConfig {
    /// Builds a config with the same `ReactorConfig` cloned across every reactor.
    pub fn uniform(
        bind_address: IpAddr,
        port: u16,
        reactor_count: usize,
        reactor: ReactorConfig,
    ) -> Self {
        Self {
            bind_address,
            port,
            listen_backlog: 1024,
            reactor_count,
            acceptor: AcceptorConfig::default(),
            reactors: std::iter::repeat_n(reactor, reactor_count).collect(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::uniform(
            IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            0,
            num_reactors_default(),
            ReactorConfig::default(),
        )
    }
}

fn num_reactors_default() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}
