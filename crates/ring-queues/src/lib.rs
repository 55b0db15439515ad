//! Lock-free queue primitives: a single-producer-single-consumer ring and
//! two multi-producer-single-consumer disciplines, built on the same
//! reserve/commit/consume shape.
//!
//! - 128-byte alignment (prefetcher false sharing elimination)
//! - Batch consumption API (single head update for N items)
//! - Adaptive backoff (spin → yield → park)
//! - Zero-copy reserve/commit API
//!
//! # Example
//!
//! ```
//! use ring_queues::{Config, Ring};
//! use std::mem::MaybeUninit;
//!
//! let ring = Ring::<u64>::new(Config::default());
//!
//! if let Some(mut reservation) = ring.reserve(1) {
//!     reservation.as_mut_slice()[0] = MaybeUninit::new(42);
//!     reservation.commit();
//! }
//!
//! let consumed = ring.consume_batch(|item: &u64| {
//!     println!("Received: {}", item);
//! });
//! ```

mod backoff;
mod cache_aligned;
mod config;
mod invariants;
pub mod mpsc_ring;
mod metrics;
mod reservation;
mod ring;
pub mod vyukov;

pub use backoff::Backoff;
pub use config::{Config, HIGH_THROUGHPUT_CONFIG, LOW_LATENCY_CONFIG};
pub use metrics::{Metrics, MetricsSnapshot};
pub use reservation::Reservation;
pub use ring::Ring;
