//! Bucketgate - Per-Key Rate Limiting Core
//!
//! This crate implements token bucket and leaky bucket admission control over
//! pluggable per-key state stores. Decisions are safe under concurrent callers:
//! every update goes through a compare-and-set loop, so an in-process map and a
//! shared key-value service are interchangeable behind the same interface.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
