//! Where per-key limiter state lives.
//!
//! Every backend exposes the same optimistic-concurrency contract: read a key,
//! then write it back only if nobody changed it in between. The limiter builds
//! its linearizable read-modify-write loop on top of that.

mod memory;
mod remote;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::clock::Timestamp;
use crate::ratelimit::KeyState;

pub use memory::InMemoryStore;
pub use remote::{KvClient, KvError, LoopbackKv, RemoteStore, KEY_PREFIX};

/// Errors raised by state stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("stored value for {key} could not be decoded: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Storage for per-key limiter state.
#[async_trait]
pub trait KeyStateStore: Send + Sync {
    /// Current state for `key`, or `None` if the key has never been seen
    /// (or was evicted).
    async fn get(&self, key: &str) -> Result<Option<KeyState>, StoreError>;

    /// Write `new` only if the stored value still equals `expected`.
    ///
    /// `expected = None` means "only if the key is absent". Returns `Ok(false)`
    /// when another writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&KeyState>,
        new: KeyState,
    ) -> Result<bool, StoreError>;

    /// Drop keys whose last update is older than `older_than`.
    ///
    /// Stores that expire entries on their own keep this default.
    async fn evict_idle(&self, _older_than: Timestamp) -> Result<usize, StoreError> {
        Ok(0)
    }
}
