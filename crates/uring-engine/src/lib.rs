//! A high-throughput TCP server engine built on Linux `io_uring`: multishot
//! accept/receive, a registered provided-buffer ring, and per-connection
//! lock-free inbound/outbound queues shared between a reactor thread and
//! async handler tasks.

pub mod acceptor;
pub mod bufring;
pub mod cancel;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod reactor;

pub use cancel::CancelToken;
pub use config::{AcceptorConfig, EngineConfig, IpFamily, ReactorConfig};
pub use connection::{Connection, FlushResult, ReadSnapshot, RingItem, WriteItem};
pub use engine::Engine;
pub use error::{ConstructionError, ContractViolation, ErrorCode, InsufficientSpace, WriteError};
