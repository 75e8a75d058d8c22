//! Core rate limiter implementation.

use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::algorithm::Policy;
use super::key::RateLimitKey;
use super::state::KeyState;
use crate::clock::{Clock, MonotonicClock};
use crate::config::{GateConfig, LimiterConfig, StoreBackend, StoreConfig};
use crate::error::{BucketgateError, Result};
use crate::store::{InMemoryStore, KeyStateStore, LoopbackKv, RemoteStore};

/// Extra idle time required before eviction, on top of the time a bucket
/// needs to come back to rest.
const EVICTION_SLACK: Duration = Duration::from_secs(1);

/// Result of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub allowed: bool,
    /// When a denied request could next succeed; `None` if allowed or never
    pub retry_after: Option<Duration>,
}

/// The core rate limiter: runs one [`Policy`] against per-key state in a
/// [`KeyStateStore`].
///
/// Every decision is a read-evaluate-compare-and-set loop. A lost race re-reads
/// the state and the clock before trying again, so no update is ever computed
/// from stale data, and decisions for one key are linearizable.
pub struct RateLimiter {
    policy: Policy,
    store: Arc<dyn KeyStateStore>,
    clock: Arc<dyn Clock>,
    max_cas_attempts: u32,
    idle_ttl: Duration,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .field("clock", &self.clock)
            .field("max_cas_attempts", &self.max_cas_attempts)
            .field("idle_ttl", &self.idle_ttl)
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter over `store`, reading time from `clock`.
    pub fn new(
        config: &LimiterConfig,
        store: Arc<dyn KeyStateStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let defaults = StoreConfig::default();
        Ok(Self {
            policy: Policy::new(config)?,
            store,
            clock,
            max_cas_attempts: defaults.max_cas_attempts,
            idle_ttl: defaults.idle_ttl(),
        })
    }

    /// Create a limiter with an in-process store and a monotonic clock.
    pub fn in_memory(config: &LimiterConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(MonotonicClock::default()),
        )
    }

    /// Build the limiter and the store described by `config`.
    pub fn from_config(config: &GateConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn KeyStateStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(InMemoryStore::new()),
            StoreBackend::Loopback => {
                Arc::new(RemoteStore::new(LoopbackKv::new(), config.store.timeout()))
            }
        };

        info!(
            algorithm = %config.limiter.algorithm,
            capacity = config.limiter.capacity,
            rate = config.limiter.rate,
            backend = ?config.store.backend,
            "Rate limiter initialized"
        );

        Ok(Self::new(&config.limiter, store, clock)?.with_store_config(&config.store))
    }

    /// Apply retry and eviction settings.
    pub fn with_store_config(mut self, store: &StoreConfig) -> Self {
        self.max_cas_attempts = store.max_cas_attempts.max(1);
        self.idle_ttl = store.idle_ttl();
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Decide one request for `key`, consuming capacity if it is admitted.
    pub async fn check(&self, key: &RateLimitKey) -> Result<Verdict> {
        for attempt in 1..=self.max_cas_attempts {
            let current = self.store.get(key.as_str()).await?;
            let now = self.clock.now();
            let evaluation = self.policy.evaluate(current.as_ref(), now);

            if let Some(skew) = evaluation.clock_skew {
                warn!(
                    key = %key,
                    skew_secs = skew,
                    "Stored timestamp is ahead of the clock; treating elapsed time as zero"
                );
            }
            if evaluation.replaced_foreign_state {
                warn!(
                    key = %key,
                    algorithm = %self.policy.algorithm(),
                    "Discarding state written by a different algorithm"
                );
            }

            if self
                .store
                .compare_and_set(key.as_str(), current.as_ref(), evaluation.next)
                .await?
            {
                trace!(
                    key = %key,
                    allowed = evaluation.allowed,
                    attempt,
                    "Rate limit decision committed"
                );
                if !evaluation.allowed {
                    debug!(key = %key, retry_after = ?evaluation.retry_after, "Rate limit exceeded");
                }
                return Ok(Verdict {
                    allowed: evaluation.allowed,
                    retry_after: evaluation.retry_after,
                });
            }

            if attempt < self.max_cas_attempts {
                Self::backoff(attempt).await;
            }
        }

        Err(BucketgateError::Contention {
            key: key.to_string(),
            attempts: self.max_cas_attempts,
        })
    }

    /// Short randomized pause so racing writers fall out of lockstep.
    async fn backoff(attempt: u32) {
        if attempt <= 2 {
            tokio::task::yield_now().await;
            return;
        }
        let ceiling = 1u64 << attempt.min(8);
        let micros = rand::thread_rng().gen_range(0..ceiling);
        tokio::time::sleep(Duration::from_micros(micros)).await;
    }

    /// Current stored state for `key`, without making a decision.
    pub async fn peek(&self, key: &RateLimitKey) -> Result<Option<KeyState>> {
        Ok(self.store.get(key.as_str()).await?)
    }

    /// Evict keys that have been idle long enough to be back at rest.
    ///
    /// A token bucket idle for `capacity / rate` is full again and a leaky
    /// bucket is empty, exactly the state a new key starts in, so evicting
    /// them changes no future decision. With `rate = 0` a drained bucket
    /// never recovers and nothing is evicted.
    pub async fn evict_idle(&self) -> Result<usize> {
        let Some(rest) = self.policy.time_to_rest() else {
            return Ok(0);
        };
        let horizon = rest.saturating_add(EVICTION_SLACK).max(self.idle_ttl);
        let cutoff = self.clock.now().saturating_sub(horizon);

        let evicted = self.store.evict_idle(cutoff).await?;
        if evicted > 0 {
            debug!(evicted, cutoff = %cutoff, "Evicted idle rate limit keys");
        }
        Ok(evicted)
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` until the limiter
    /// is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(strong) = limiter.upgrade() else {
                    debug!("Rate limiter dropped, stopping sweeper");
                    break;
                };
                if let Err(e) = strong.evict_idle().await {
                    warn!(error = %e, "Idle key sweep failed");
                }
            }
        })
    }
}
