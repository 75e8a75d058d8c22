//! Rate limit key handling.

use std::fmt;

/// Identifier used when a request carries none.
pub const ANONYMOUS: &str = "anonymous";

/// The entity a limit applies to: a user id, client IP, API key and so on.
///
/// Keys are opaque and independent of each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Create a key from an already-normalized identifier.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build a key from a raw request identifier.
    ///
    /// Surrounding whitespace is ignored and a blank identifier falls back to
    /// [`ANONYMOUS`], so all unidentified callers share one bucket.
    pub fn from_identifier(identifier: &str) -> Self {
        let trimmed = identifier.trim();
        if trimmed.is_empty() {
            Self(ANONYMOUS.to_string())
        } else {
            Self(trimmed.to_string())
        }
    }

    /// Build a key within a scope, e.g. `login:alice`, so one store can hold
    /// several independent limits for the same identifier.
    pub fn scoped(scope: &str, identifier: &str) -> Self {
        let id = Self::from_identifier(identifier);
        Self(format!("{}:{}", scope, id.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RateLimitKey {
    fn from(identifier: &str) -> Self {
        Self::from_identifier(identifier)
    }
}

impl From<String> for RateLimitKey {
    fn from(identifier: String) -> Self {
        Self::from_identifier(&identifier)
    }
}
