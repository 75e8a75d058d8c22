//! Admission trait for abstracting over how decisions are made.

use std::time::Duration;

use async_trait::async_trait;

/// What the request-handling layer learns about one request.
///
/// Internal bucket levels are deliberately not exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Suggested wait before retrying a denied request
    pub retry_after: Option<Duration>,
    /// The store failed and the configured failure policy made this call
    pub degraded: bool,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: None,
            degraded: false,
        }
    }

    pub fn deny(retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            retry_after,
            degraded: false,
        }
    }

    /// Whole seconds to advertise in a `Retry-After` header, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|wait| {
            let secs = wait.as_secs();
            if wait.subsec_nanos() > 0 {
                secs + 1
            } else {
                secs
            }
        })
    }
}

/// Trait for admission control implementations.
///
/// HTTP handlers and other callers depend on this rather than on a concrete
/// limiter, so they can be tested with a stub.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Decide whether the request identified by `identifier` may proceed.
    async fn decide(&self, identifier: &str) -> Decision;
}
