//! Per-key numeric state persisted by a [`KeyStateStore`](crate::store::KeyStateStore).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

/// Fixed-point resolution: one token is this many units.
pub const UNITS_PER_TOKEN: u64 = 1_000_000_000;

/// A token (or water level) amount in billionths of a token.
///
/// Integer arithmetic keeps `available` and `capacity - level` exact duals,
/// so token and leaky buckets never drift apart through rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tokens(u64);

impl Tokens {
    pub const ZERO: Tokens = Tokens(0);
    pub const ONE: Tokens = Tokens(UNITS_PER_TOKEN);

    pub const fn from_units(units: u64) -> Self {
        Self(units)
    }

    /// Whole tokens, saturating at the representable maximum.
    pub const fn whole(tokens: u64) -> Self {
        Self(tokens.saturating_mul(UNITS_PER_TOKEN))
    }

    /// Round a fractional token count to the nearest unit. Negative input is zero.
    pub fn from_f64(tokens: f64) -> Self {
        Self((tokens.max(0.0) * UNITS_PER_TOKEN as f64).round() as u64)
    }

    pub const fn as_units(&self) -> u64 {
        self.0
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / UNITS_PER_TOKEN as f64
    }
}

impl fmt::Display for Tokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:09}",
            self.0 / UNITS_PER_TOKEN,
            self.0 % UNITS_PER_TOKEN
        )
    }
}

/// Token bucket state: tokens left and when they were last topped up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently in the bucket, in `[0, capacity]`
    pub available: Tokens,
    /// When refill was last applied
    pub last_refill: Timestamp,
}

impl BucketState {
    /// A bucket seen for the first time starts full.
    pub fn full(capacity: Tokens, now: Timestamp) -> Self {
        Self {
            available: capacity,
            last_refill: now,
        }
    }
}

/// Leaky bucket state: current water level and when it last drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelState {
    /// Units currently queued, in `[0, capacity]`
    pub level: Tokens,
    /// When leakage was last applied
    pub last_leak: Timestamp,
}

impl LevelState {
    /// A bucket seen for the first time starts empty.
    pub fn empty(now: Timestamp) -> Self {
        Self {
            level: Tokens::ZERO,
            last_leak: now,
        }
    }
}

/// The value a store keeps for one rate limit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum KeyState {
    Bucket(BucketState),
    Level(LevelState),
}

impl KeyState {
    /// Time of the last decision recorded in this state.
    pub fn updated_at(&self) -> Timestamp {
        match self {
            KeyState::Bucket(s) => s.last_refill,
            KeyState::Level(s) => s.last_leak,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_conversions() {
        assert_eq!(Tokens::whole(3), Tokens::from_units(3_000_000_000));
        assert_eq!(Tokens::from_f64(0.1).as_units(), 100_000_000);
        assert_eq!(Tokens::from_f64(-2.0), Tokens::ZERO);
        assert_eq!(Tokens::from_f64(2.5).as_f64(), 2.5);
        assert_eq!(Tokens::from_units(1_500_000_000).to_string(), "1.500000000");
    }

    #[test]
    fn test_initial_states() {
        let now = Timestamp::from_secs_f64(3.0);

        let bucket = BucketState::full(Tokens::whole(5), now);
        assert_eq!(bucket.available, Tokens::whole(5));
        assert_eq!(bucket.last_refill, now);

        let level = LevelState::empty(now);
        assert_eq!(level.level, Tokens::ZERO);
        assert_eq!(level.last_leak, now);
    }

    #[test]
    fn test_updated_at() {
        let now = Timestamp::from_nanos(42);
        assert_eq!(KeyState::Bucket(BucketState::full(Tokens::ONE, now)).updated_at(), now);
        assert_eq!(KeyState::Level(LevelState::empty(now)).updated_at(), now);
    }

    #[test]
    fn test_key_state_json_shape() {
        let state = KeyState::Level(LevelState {
            level: Tokens::from_f64(2.5),
            last_leak: Timestamp::from_nanos(1_000),
        });
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"kind":"level","level":2500000000,"last_leak":1000}"#);
    }
}
