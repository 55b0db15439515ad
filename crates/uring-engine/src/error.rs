//! Error categories for the engine, per the three-way split the design
//! draws between fatal construction errors, per-connection errors signalled
//! through a snapshot, and user contract violations.

use thiserror::Error;

/// Fatal at construction: surfaced immediately, before any thread starts.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("{field} must be a power of two, got {value}")]
    NotPowerOfTwo { field: &'static str, value: usize },

    #[error("config.reactors must have exactly reactor_count ({reactor_count}) entries, got {actual}")]
    ReactorCountMismatch { reactor_count: usize, actual: usize },

    #[error("failed to bind listener: {0}")]
    Listen(#[source] std::io::Error),

    #[error("failed to create io_uring: {0}")]
    RingSetup(#[source] std::io::Error),

    #[error("failed to register buffer ring: {0}")]
    BufferRingRegister(#[source] std::io::Error),
}

/// Carried on a [`crate::connection::ReadSnapshot`] and on the flush result.
/// `None` means no error; every other variant is a reason the connection
/// closed, distinguishing a clean EOF from a kernel-reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    None,
    Eof,
    ReceiveFailed,
    SendFailed,
    RingFull,
    StaleGeneration,
    Cancelled,
}

/// A programming fault distinct from any network condition: double reader,
/// write during flush, advance beyond the slab. These are never retried or
/// silently absorbed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("read_async called while a reader is already armed on this connection")]
    DoubleReader,

    #[error("flush_async called while a flush is already in progress or armed")]
    DoubleFlush,

    #[error("write attempted while a flush is in progress")]
    WriteDuringFlush,

    #[error("advance({requested}) would move tail past the write slab (capacity {capacity})")]
    AdvanceBeyondSlab { requested: usize, capacity: usize },
}

/// Ordinary, non-contract write failure: the slab doesn't have enough
/// remaining room for the request. Distinct from [`ContractViolation`]
/// because retrying after a flush is the expected caller response.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("write slab has {available} bytes remaining, requested {requested}")]
pub struct InsufficientSpace {
    pub requested: usize,
    pub available: usize,
}

/// The union of failure modes `write`/`get_span` can report.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error(transparent)]
    InsufficientSpace(#[from] InsufficientSpace),
}
