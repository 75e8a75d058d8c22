//! State store backed by a shared key-value service.
//!
//! [`RemoteStore`] works with any client that offers get and compare-and-swap on
//! string values, which is what Redis (`WATCH`/`MULTI`), etcd transactions and
//! Consul's check-and-set all provide. The wire protocol belongs to the
//! [`KvClient`] implementation; this module only handles encoding, key naming
//! and timeouts.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use super::{KeyStateStore, StoreError};
use crate::ratelimit::KeyState;

/// Namespace for every key this crate writes to a shared store.
pub const KEY_PREFIX: &str = "bucketgate";

/// Errors reported by a key-value client.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Minimal client surface a shared key-value service must offer.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Set `key` to `new` only if its current value is `expected`
    /// (`None` = key absent).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
    ) -> Result<bool, KvError>;

    /// Remove `key` only if its current value is `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, KvError>;
}

#[async_trait]
impl<T: KvClient + ?Sized> KvClient for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        (**self).get(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
    ) -> Result<bool, KvError> {
        (**self).compare_and_swap(key, expected, new).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        (**self).compare_and_delete(key, expected).await
    }
}

/// A [`KeyStateStore`] over a shared key-value service.
#[derive(Debug)]
pub struct RemoteStore<C> {
    client: C,
    timeout: Duration,
}

impl<C: KvClient> RemoteStore<C> {
    /// Wrap `client`, failing any single call that takes longer than `timeout`.
    pub fn new(client: C, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Key under which `key`'s state is stored.
    /// Format: "bucketgate|{key}"
    pub fn storage_key(key: &str) -> String {
        format!("{}|{}", KEY_PREFIX, key)
    }

    async fn call<T, F>(&self, op: &'static str, key: &str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, KvError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(key = %key, op, error = %e, "Remote store call failed");
                Err(StoreError::Unavailable(e.to_string()))
            }
            Err(_) => {
                warn!(key = %key, op, timeout = ?self.timeout, "Remote store call timed out");
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }

    fn encode(key: &str, state: &KeyState) -> Result<String, StoreError> {
        serde_json::to_string(state).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn decode(key: &str, raw: &str) -> Result<KeyState, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl<C: KvClient> KeyStateStore for RemoteStore<C> {
    async fn get(&self, key: &str) -> Result<Option<KeyState>, StoreError> {
        let storage_key = Self::storage_key(key);
        let Some(raw) = self.call("get", key, self.client.get(&storage_key)).await? else {
            return Ok(None);
        };
        match Self::decode(key, &raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                // An undecodable value can never be matched by a compare-and-set,
                // so drop it and let the key start over from its initial state.
                warn!(key = %key, error = %e, "Discarding corrupt stored state");
                self.call(
                    "compare_and_delete",
                    key,
                    self.client.compare_and_delete(&storage_key, &raw),
                )
                .await?;
                let raw = self.call("get", key, self.client.get(&storage_key)).await?;
                raw.map(|raw| Self::decode(key, &raw)).transpose()
            }
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&KeyState>,
        new: KeyState,
    ) -> Result<bool, StoreError> {
        let storage_key = Self::storage_key(key);
        // Values are only ever written by `encode`, so re-encoding what we read
        // reproduces the stored bytes exactly.
        let expected = expected.map(|s| Self::encode(key, s)).transpose()?;
        let new = Self::encode(key, &new)?;

        let swapped = self
            .call(
                "compare_and_swap",
                key,
                self.client
                    .compare_and_swap(&storage_key, expected.as_deref(), new),
            )
            .await?;

        if !swapped {
            debug!(key = %key, "Remote compare-and-swap lost a race");
        }
        Ok(swapped)
    }
}

/// An in-process [`KvClient`] that behaves like a remote service.
///
/// Latency and availability can be changed at runtime, which makes it useful
/// for exercising timeout and failure handling without a network.
#[derive(Debug)]
pub struct LoopbackKv {
    values: DashMap<String, String>,
    latency: RwLock<Duration>,
    available: AtomicBool,
}

impl Default for LoopbackKv {
    fn default() -> Self {
        Self {
            values: DashMap::new(),
            latency: RwLock::new(Duration::ZERO),
            available: AtomicBool::new(true),
        }
    }
}

impl LoopbackKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every request by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// When `false`, every request fails with a connection error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Raw value stored under `key`.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    /// Overwrite `key` unconditionally.
    pub fn put_raw(&self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    async fn round_trip(&self) -> Result<(), KvError> {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(KvError::Connection("loopback store is down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvClient for LoopbackKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.round_trip().await?;
        Ok(self.raw(key))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
    ) -> Result<bool, KvError> {
        self.round_trip().await?;
        let swapped = match self.values.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if expected == Some(occupied.get().as_str()) {
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
        Ok(swapped)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        self.round_trip().await?;
        Ok(self.values.remove_if(key, |_, v| v == expected).is_some())
    }
}
