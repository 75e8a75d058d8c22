//! In-process state store.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{KeyStateStore, StoreError};
use crate::clock::Timestamp;
use crate::ratelimit::KeyState;

/// A sharded concurrent map of key states.
///
/// Compare-and-set runs under the lock of the shard holding the key, so
/// decisions for different keys rarely contend and never share a global lock.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, KeyState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every key.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl KeyStateStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyState>, StoreError> {
        Ok(self.entries.get(key).map(|entry| *entry.value()))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&KeyState>,
        new: KeyState,
    ) -> Result<bool, StoreError> {
        let swapped = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if expected == Some(occupied.get()) {
                    occupied.insert(new);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(new);
                    true
                } else {
                    false
                }
            }
        };

        if !swapped {
            trace!(key = %key, "compare-and-set conflict");
        }
        Ok(swapped)
    }

    async fn evict_idle(&self, older_than: Timestamp) -> Result<usize, StoreError> {
        let evicted = AtomicUsize::new(0);
        self.entries.retain(|_, state| {
            let keep = state.updated_at() >= older_than;
            if !keep {
                evicted.fetch_add(1, Ordering::Relaxed);
            }
            keep
        });
        Ok(evicted.into_inner())
    }
}
