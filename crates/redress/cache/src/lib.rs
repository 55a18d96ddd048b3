//! Shared KV layer backing job progress, rate limits, circuit breakers,
//! dedup windows and unique-job locks.
//!
//! The pipeline treats the KV as one of its two ambient resources (the
//! other is the relational store). Nothing here is transactional across
//! keys: every sequence is either idempotent or guarded by a short-lived
//! lease.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod breaker;
mod kv;
mod limiter;
mod progress;

pub use breaker::CircuitBreaker;
pub use kv::{Kv, Lease, MemoryKv};
pub use limiter::RateLimiter;
pub use progress::ProgressTracker;

use std::sync::Arc;

/// Shared handle to the KV implementation in use.
pub type KvHandle = Arc<dyn Kv>;
