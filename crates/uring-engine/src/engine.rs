//! The façade that wires an [`crate::acceptor::Acceptor`] and a pool of
//! [`crate::reactor::Reactor`]s together: construct with options, start
//! non-blocking, hand accepted connections to users via `accept_async`,
//! stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::info;

use crate::acceptor::Acceptor;
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::connection::Connection;
use crate::error::ConstructionError;
use crate::reactor::Reactor;

/// Owns the acceptor and reactor threads and the unbounded channel of
/// accepted connections that [`Engine::accept_async`] drains.
pub struct Engine {
    running: Arc<AtomicBool>,
    acceptor_handle: Option<JoinHandle<()>>,
    reactor_handles: Vec<JoinHandle<()>>,
    accept_rx: mpsc::UnboundedReceiver<Arc<Connection>>,
    local_port: u16,
}

impl Engine {
    /// Builds the acceptor and reactors but does not start any threads —
    /// call [`Engine::start`] to do that. Surfaces construction failures
    /// (bad address, ring setup failure, non-power-of-two capacities)
    /// before anything is spawned.
    pub fn new(config: EngineConfig) -> Result<Self, ConstructionError> {
        if config.reactors.len() != config.reactor_count {
            return Err(ConstructionError::ReactorCountMismatch {
                reactor_count: config.reactor_count,
                actual: config.reactors.len(),
            });
        }
        for reactor_cfg in &config.reactors {
            if !reactor_cfg.buffer_ring_entries.is_power_of_two() {
                return Err(ConstructionError::NotPowerOfTwo {
                    field: "buffer_ring_entries",
                    value: reactor_cfg.buffer_ring_entries,
                });
            }
            if !reactor_cfg.inbound_ring_capacity.is_power_of_two() {
                return Err(ConstructionError::NotPowerOfTwo {
                    field: "inbound_ring_capacity",
                    value: reactor_cfg.inbound_ring_capacity,
                });
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let (publish_tx, accept_rx) = mpsc::unbounded_channel::<Arc<Connection>>();

        let mut reactors = Vec::with_capacity(config.reactor_count);
        let mut accept_senders = Vec::with_capacity(config.reactor_count);
        for (id, reactor_cfg) in config.reactors.iter().cloned().enumerate() {
            let (accept_tx, reactor_accept_rx) = mpsc::unbounded_channel();
            let reactor = Reactor::new(
                id,
                reactor_cfg,
                reactor_accept_rx,
                publish_tx.clone(),
                Arc::clone(&running),
            );
            reactors.push(reactor);
            accept_senders.push(accept_tx);
        }

        let acceptor = Acceptor::new(
            config.bind_address,
            config.port,
            config.listen_backlog,
            accept_senders,
            config.acceptor.clone(),
            Arc::clone(&running),
        )?;
        let local_port = acceptor.local_addr().map_err(ConstructionError::Listen)?.port();

        // `IORING_SETUP_SINGLE_ISSUER` binds a ring to whichever task first
        // drives it, so each ring is built inside its own thread's `run`
        // rather than here. Each thread reports back over `ready` before
        // doing anything else, so a failure still surfaces synchronously —
        // and any thread that already started is torn down along with it.
        let (acceptor_ready_tx, acceptor_ready_rx) = std::sync::mpsc::channel();
        let acceptor_handle = std::thread::Builder::new()
            .name("uring-acceptor".into())
            .spawn(move || acceptor.run(acceptor_ready_tx))
            .expect("failed to spawn acceptor thread");

        let mut reactor_handles = Vec::with_capacity(reactors.len());
        let mut reactor_readies = Vec::with_capacity(reactors.len());
        for (id, reactor) in reactors.into_iter().enumerate() {
            let (ready_tx, ready_rx) = std::sync::mpsc::channel();
            let handle = std::thread::Builder::new()
                .name(format!("uring-reactor-{id}"))
                .spawn(move || reactor.run(ready_tx))
                .expect("failed to spawn reactor thread");
            reactor_handles.push(handle);
            reactor_readies.push(ready_rx);
        }

        let mut construction_error = acceptor_ready_rx.recv().ok().and_then(Result::err);
        for ready_rx in reactor_readies {
            if construction_error.is_none() {
                construction_error = ready_rx.recv().ok().and_then(Result::err);
            }
        }

        if let Some(e) = construction_error {
            running.store(false, Ordering::Release);
            let _ = acceptor_handle.join();
            for handle in reactor_handles {
                let _ = handle.join();
            }
            return Err(e);
        }

        info!(port = local_port, reactors = config.reactor_count, "engine started");

        Ok(Self {
            running,
            acceptor_handle: Some(acceptor_handle),
            reactor_handles,
            accept_rx,
            local_port,
        })
    }

    /// Non-blocking: threads are already running once `new` returns.
    /// Kept as a distinct call so the construct/start split from the design
    /// is visible at the call site even though this implementation starts
    /// eagerly in `new`.
    pub fn start(&self) {}

    /// Port actually bound, useful when `EngineConfig::port` was `0`.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Drains the next accepted connection. Resolves to `None` once the
    /// engine has been stopped and every in-flight connection drained, or
    /// once `cancel` is cancelled — whichever comes first. If the
    /// descriptor backing a published connection was already torn down
    /// between publication and this call, it's skipped in favor of the
    /// next one, per the design's façade contract.
    pub async fn accept_async(&mut self, cancel: &CancelToken) -> Option<Arc<Connection>> {
        loop {
            tokio::select! {
                conn = self.accept_rx.recv() => {
                    let conn = conn?;
                    if conn.is_closed() {
                        continue;
                    }
                    return Some(conn);
                }
                () = cancel.cancelled() => return None,
            }
        }
    }

    /// Signals the running flag observed at the head of every acceptor and
    /// reactor loop iteration, then joins every thread. Reactors close
    /// their remaining connections and free their buffer rings before
    /// destroying their kernel ring; the acceptor closes the listener last.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.acceptor_handle.take() {
            let _ = handle.join();
        }
        for handle in self.reactor_handles.drain(..) {
            let _ = handle.join();
        }
        self.accept_rx.close();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.acceptor_handle.is_some() || !self.reactor_handles.is_empty() {
            self.stop();
        }
    }
}
