//! The boundary request-handling code talks to.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::backend::{AdmissionControl, Decision};
use super::key::RateLimitKey;
use super::limiter::RateLimiter;
use crate::config::FailurePolicy;
use crate::error::BucketgateError;

/// Turns request identifiers into allow/deny answers.
///
/// Store outages and runaway contention never reach the caller: they are
/// resolved by the configured [`FailurePolicy`] and flagged as `degraded`.
#[derive(Debug, Clone)]
pub struct AdmissionFacade {
    limiter: Arc<RateLimiter>,
    failure_policy: FailurePolicy,
}

impl AdmissionFacade {
    /// Create a facade that fails closed.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self::with_failure_policy(limiter, FailurePolicy::default())
    }

    pub fn with_failure_policy(limiter: Arc<RateLimiter>, failure_policy: FailurePolicy) -> Self {
        Self {
            limiter,
            failure_policy,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Decide a request for an already-built key.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn decide_key(&self, key: &RateLimitKey) -> Decision {
        match self.limiter.check(key).await {
            Ok(verdict) if verdict.allowed => Decision::allow(),
            Ok(verdict) => Decision::deny(verdict.retry_after),
            Err(e) => self.resolve_failure(key, e),
        }
    }

    fn resolve_failure(&self, key: &RateLimitKey, error: BucketgateError) -> Decision {
        let allowed = matches!(self.failure_policy, FailurePolicy::FailOpen);
        warn!(
            key = %key,
            error = %error,
            policy = ?self.failure_policy,
            allowed,
            "Rate limiter unavailable, applying failure policy"
        );
        Decision {
            allowed,
            retry_after: None,
            degraded: true,
        }
    }
}

#[async_trait]
impl AdmissionControl for AdmissionFacade {
    async fn decide(&self, identifier: &str) -> Decision {
        let key = RateLimitKey::from_identifier(identifier);
        let decision = self.decide_key(&key).await;
        debug!(key = %key, allowed = decision.allowed, "Admission decided");
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, Timestamp};
    use crate::config::LimiterConfig;
    use crate::ratelimit::Algorithm;
    use crate::store::{InMemoryStore, LoopbackKv, RemoteStore};
    use std::time::Duration;

    fn config(capacity: f64, rate: f64) -> LimiterConfig {
        LimiterConfig {
            algorithm: Algorithm::Token,
            capacity,
            rate,
        }
    }

    fn memory_facade(capacity: f64, rate: f64) -> (AdmissionFacade, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let limiter = RateLimiter::new(
            &config(capacity, rate),
            Arc::new(InMemoryStore::new()),
            clock.clone(),
        )
        .unwrap();
        (AdmissionFacade::new(Arc::new(limiter)), clock)
    }

    fn remote_facade(policy: FailurePolicy) -> (AdmissionFacade, Arc<LoopbackKv>) {
        let kv = Arc::new(LoopbackKv::new());
        let limiter = RateLimiter::new(
            &config(2.0, 1.0),
            Arc::new(RemoteStore::new(kv.clone(), Duration::from_millis(20))),
            Arc::new(ManualClock::default()),
        )
        .unwrap();
        (
            AdmissionFacade::with_failure_policy(Arc::new(limiter), policy),
            kv,
        )
    }

    #[tokio::test]
    async fn test_decide_allows_then_denies() {
        let (facade, clock) = memory_facade(2.0, 0.5);

        assert_eq!(facade.decide("alice").await, Decision::allow());
        assert_eq!(facade.decide("alice").await, Decision::allow());

        let denied = facade.decide("alice").await;
        assert!(!denied.allowed);
        assert!(!denied.degraded);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(2)));

        clock.set(Timestamp::from_secs_f64(2.0));
        assert!(facade.decide("alice").await.allowed);
    }

    #[tokio::test]
    async fn test_blank_identifiers_share_anonymous_bucket() {
        let (facade, _) = memory_facade(1.0, 0.0);

        assert!(facade.decide("").await.allowed);
        assert!(!facade.decide("   ").await.allowed);
        assert!(!facade.decide("anonymous").await.allowed);
        assert!(facade.decide("carol").await.allowed);
    }

    #[tokio::test]
    async fn test_default_policy_fails_closed() {
        let (facade, kv) = remote_facade(FailurePolicy::default());
        kv.set_available(false);

        let decision = facade.decide("alice").await;
        assert!(!decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.retry_after, None);
    }

    #[tokio::test]
    async fn test_fail_open_policy() {
        let (facade, kv) = remote_facade(FailurePolicy::FailOpen);
        kv.set_available(false);

        let decision = facade.decide("alice").await;
        assert!(decision.allowed);
        assert!(decision.degraded);
    }

    #[tokio::test]
    async fn test_timeout_is_resolved_by_policy() {
        let (facade, kv) = remote_facade(FailurePolicy::FailClosed);
        kv.set_latency(Duration::from_millis(200));

        let decision = facade.decide("alice").await;
        assert!(!decision.allowed);
        assert!(decision.degraded);
    }

    #[tokio::test]
    async fn test_recovers_after_outage() {
        let (facade, kv) = remote_facade(FailurePolicy::FailClosed);

        assert!(facade.decide("alice").await.allowed);
        kv.set_available(false);
        assert!(facade.decide("alice").await.degraded);
        kv.set_available(true);

        // The outage consumed nothing: one token is still left
        let decision = facade.decide("alice").await;
        assert!(decision.allowed);
        assert!(!decision.degraded);
        assert!(!facade.decide("alice").await.allowed);
    }

    #[tokio::test]
    async fn test_corrupt_state_does_not_lock_out_key() {
        let (facade, kv) = remote_facade(FailurePolicy::FailClosed);
        kv.put_raw("bucketgate|alice", r#"{"kind":"bucket","available":"#);

        let decision = facade.decide("alice").await;
        assert!(decision.allowed);
        assert!(!decision.degraded);
        assert!(facade.decide("alice").await.allowed);
        assert!(!facade.decide("alice").await.allowed);
    }

    #[tokio::test]
    async fn test_used_through_trait_object() {
        let (facade, _) = memory_facade(1.0, 1.0);
        let control: Arc<dyn AdmissionControl> = Arc::new(facade);

        assert!(control.decide("dave").await.allowed);
        assert!(!control.decide("dave").await.allowed);
    }
}
