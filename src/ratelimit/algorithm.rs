//! Token bucket and leaky bucket decision math.
//!
//! Both algorithms are pure functions of `(config, stored state, now)`. They never
//! touch a store; the [`RateLimiter`](super::RateLimiter) feeds them whatever
//! it read and persists whatever they return.
//!
//! Amounts are fixed-point [`Tokens`] and time is integer nanoseconds. Refill
//! over an interval is computed once, rounded down, and shared by both
//! algorithms, so a token bucket's `available` is always exactly
//! `capacity - level` of the equivalent leaky bucket.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::state::{BucketState, KeyState, LevelState, Tokens};
use crate::clock::Timestamp;
use crate::config::LimiterConfig;
use crate::error::Result;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Which admission algorithm a limiter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Tokens refill continuously; each admitted request takes one.
    #[default]
    #[serde(alias = "token_bucket")]
    Token,
    /// Level drains continuously; each admitted request adds one unit.
    #[serde(alias = "leaky_bucket")]
    Leaky,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Token => write!(f, "token"),
            Algorithm::Leaky => write!(f, "leaky"),
        }
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "token" | "token_bucket" => Ok(Algorithm::Token),
            "leaky" | "leaky_bucket" => Ok(Algorithm::Leaky),
            other => Err(format!("unknown algorithm '{}', expected 'token' or 'leaky'", other)),
        }
    }
}

/// Outcome of running one decision against a key's state.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Whether the request is admitted
    pub allowed: bool,
    /// State to persist, whether or not the request was admitted
    pub next: KeyState,
    /// Earliest time a retry could succeed, if it ever can
    pub retry_after: Option<Duration>,
    /// Seconds the stored timestamp was ahead of `now`, when it was
    pub clock_skew: Option<f64>,
    /// The stored state belonged to the other algorithm and was discarded
    pub replaced_foreign_state: bool,
}

/// A validated limiter configuration ready to make decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    algorithm: Algorithm,
    capacity: Tokens,
    /// Token units refilled (or leaked) per second
    rate: u64,
}

impl Policy {
    /// Validate `config` and build a policy from it.
    pub fn new(config: &LimiterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            algorithm: config.algorithm,
            capacity: Tokens::from_f64(config.capacity),
            rate: Tokens::from_f64(config.rate).as_units(),
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn capacity(&self) -> Tokens {
        self.capacity
    }

    /// Tokens per second.
    pub fn rate(&self) -> Tokens {
        Tokens::from_units(self.rate)
    }

    /// How long a key must sit idle before its bucket is back at rest
    /// (full for token, empty for leaky). `None` when it never gets there.
    pub fn time_to_rest(&self) -> Option<Duration> {
        if self.capacity == Tokens::ZERO {
            return Some(Duration::ZERO);
        }
        self.time_to_accrue(self.capacity.as_units())
    }

    /// Decide one request against `current` at time `now`.
    ///
    /// A missing state, or one written by the other algorithm, is replaced
    /// by the algorithm's initial state before deciding.
    pub fn evaluate(&self, current: Option<&KeyState>, now: Timestamp) -> Evaluation {
        match self.algorithm {
            Algorithm::Token => {
                let (prior, foreign) = match current {
                    Some(KeyState::Bucket(s)) => (Some(*s), false),
                    Some(KeyState::Level(_)) => (None, true),
                    None => (None, false),
                };
                let mut evaluation = self.evaluate_token(prior, now);
                evaluation.replaced_foreign_state = foreign;
                evaluation
            }
            Algorithm::Leaky => {
                let (prior, foreign) = match current {
                    Some(KeyState::Level(s)) => (Some(*s), false),
                    Some(KeyState::Bucket(_)) => (None, true),
                    None => (None, false),
                };
                let mut evaluation = self.evaluate_leaky(prior, now);
                evaluation.replaced_foreign_state = foreign;
                evaluation
            }
        }
    }

    fn evaluate_token(&self, prior: Option<BucketState>, now: Timestamp) -> Evaluation {
        let state = prior.unwrap_or_else(|| BucketState::full(self.capacity, now));
        let (elapsed, clock_skew) = clamp_elapsed(now, state.last_refill);

        let capacity = self.capacity.as_units();
        let refilled = (state.available.as_units() as u128 + self.accrued(elapsed))
            .min(capacity as u128) as u64;
        let last_refill = now.max(state.last_refill);
        let one = Tokens::ONE.as_units();

        if refilled < one {
            Evaluation {
                allowed: false,
                next: KeyState::Bucket(BucketState {
                    available: Tokens::from_units(refilled),
                    last_refill,
                }),
                retry_after: self.wait_for(one - refilled),
                clock_skew,
                replaced_foreign_state: false,
            }
        } else {
            Evaluation {
                allowed: true,
                next: KeyState::Bucket(BucketState {
                    available: Tokens::from_units(refilled - one),
                    last_refill,
                }),
                retry_after: None,
                clock_skew,
                replaced_foreign_state: false,
            }
        }
    }

    fn evaluate_leaky(&self, prior: Option<LevelState>, now: Timestamp) -> Evaluation {
        let state = prior.unwrap_or_else(|| LevelState::empty(now));
        let (elapsed, clock_skew) = clamp_elapsed(now, state.last_leak);

        let stored = state.level.as_units();
        let leaked = self.accrued(elapsed).min(stored as u128) as u64;
        let level = stored - leaked;
        let last_leak = now.max(state.last_leak);
        let capacity = self.capacity.as_units();
        let one = Tokens::ONE.as_units();

        if level as u128 + one as u128 > capacity as u128 {
            Evaluation {
                allowed: false,
                next: KeyState::Level(LevelState {
                    level: Tokens::from_units(level),
                    last_leak,
                }),
                retry_after: self.wait_for(level + one - capacity),
                clock_skew,
                replaced_foreign_state: false,
            }
        } else {
            Evaluation {
                allowed: true,
                next: KeyState::Level(LevelState {
                    level: Tokens::from_units(level + one),
                    last_leak,
                }),
                retry_after: None,
                clock_skew,
                replaced_foreign_state: false,
            }
        }
    }

    /// Units refilled (or leaked) over `elapsed_nanos`, rounded down.
    fn accrued(&self, elapsed_nanos: u64) -> u128 {
        elapsed_nanos as u128 * self.rate as u128 / NANOS_PER_SEC
    }

    /// Retry hint for a denied request short by `deficit` units. `None` when
    /// no amount of waiting helps.
    fn wait_for(&self, deficit: u64) -> Option<Duration> {
        if self.capacity < Tokens::ONE {
            return None;
        }
        self.time_to_accrue(deficit)
    }

    /// Shortest wait after which [`accrued`](Self::accrued) covers `units`.
    fn time_to_accrue(&self, units: u64) -> Option<Duration> {
        if self.rate == 0 {
            return None;
        }
        let nanos = (units as u128 * NANOS_PER_SEC).div_ceil(self.rate as u128);
        u64::try_from(nanos).ok().map(Duration::from_nanos)
    }
}

/// Nanoseconds since `last`, never negative.
fn clamp_elapsed(now: Timestamp, last: Timestamp) -> (u64, Option<f64>) {
    if now < last {
        (0, Some(last.seconds_since(now)))
    } else {
        (now.as_nanos() - last.as_nanos(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn policy(algorithm: Algorithm, capacity: f64, rate: f64) -> Policy {
        Policy::new(&LimiterConfig {
            algorithm,
            capacity,
            rate,
        })
        .unwrap()
    }

    fn at(secs: f64) -> Timestamp {
        Timestamp::from_secs_f64(secs)
    }

    fn tokens(amount: f64) -> Tokens {
        Tokens::from_f64(amount)
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("token".parse::<Algorithm>().unwrap(), Algorithm::Token);
        assert_eq!("Leaky_Bucket".parse::<Algorithm>().unwrap(), Algorithm::Leaky);
        assert!("fixed_window".parse::<Algorithm>().is_err());
        assert_eq!(Algorithm::Leaky.to_string(), "leaky");
    }

    #[test]
    fn test_token_first_request_starts_full() {
        let policy = policy(Algorithm::Token, 5.0, 1.0);
        let eval = policy.evaluate(None, at(0.0));

        assert!(eval.allowed);
        assert_eq!(
            eval.next,
            KeyState::Bucket(BucketState {
                available: tokens(4.0),
                last_refill: at(0.0)
            })
        );
    }

    #[test]
    fn test_token_denial_still_advances_timestamp() {
        let policy = policy(Algorithm::Token, 5.0, 1.0);
        let empty = KeyState::Bucket(BucketState {
            available: Tokens::ZERO,
            last_refill: at(0.0),
        });

        let eval = policy.evaluate(Some(&empty), at(0.5));
        assert!(!eval.allowed);
        assert_eq!(
            eval.next,
            KeyState::Bucket(BucketState {
                available: tokens(0.5),
                last_refill: at(0.5)
            })
        );
        assert_eq!(eval.retry_after, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_token_refill_is_capped() {
        let policy = policy(Algorithm::Token, 3.0, 10.0);
        let state = KeyState::Bucket(BucketState {
            available: Tokens::ZERO,
            last_refill: at(0.0),
        });

        let eval = policy.evaluate(Some(&state), at(100.0));
        assert!(eval.allowed);
        assert_eq!(
            eval.next,
            KeyState::Bucket(BucketState {
                available: tokens(2.0),
                last_refill: at(100.0)
            })
        );
    }

    #[test]
    fn test_token_zero_capacity_denies_first_request() {
        let policy = policy(Algorithm::Token, 0.0, 1.0);
        let eval = policy.evaluate(None, at(0.0));

        assert!(!eval.allowed);
        assert_eq!(eval.retry_after, None);
        assert_eq!(
            eval.next,
            KeyState::Bucket(BucketState {
                available: Tokens::ZERO,
                last_refill: at(0.0)
            })
        );
    }

    #[test]
    fn test_token_zero_rate_has_no_retry_hint() {
        let policy = policy(Algorithm::Token, 1.0, 0.0);
        let first = policy.evaluate(None, at(0.0));
        assert!(first.allowed);

        let second = policy.evaluate(Some(&first.next), at(1_000.0));
        assert!(!second.allowed);
        assert_eq!(second.retry_after, None);
    }

    #[test]
    fn test_retry_hint_is_long_enough() {
        let policy = policy(Algorithm::Token, 1.0, 0.3);
        let first = policy.evaluate(None, at(0.0));
        let denied = policy.evaluate(Some(&first.next), at(0.0));
        assert!(!denied.allowed);

        let wait = denied.retry_after.unwrap();
        let retry_at = Timestamp::from_nanos(wait.as_nanos() as u64);
        assert!(policy.evaluate(Some(&denied.next), retry_at).allowed);

        let just_before = Timestamp::from_nanos(wait.as_nanos() as u64 - 1);
        assert!(!policy.evaluate(Some(&denied.next), just_before).allowed);
    }

    #[test]
    fn test_negative_elapsed_is_clamped() {
        let policy = policy(Algorithm::Token, 5.0, 1.0);
        let state = KeyState::Bucket(BucketState {
            available: Tokens::ZERO,
            last_refill: at(10.0),
        });

        let eval = policy.evaluate(Some(&state), at(7.0));
        assert!(!eval.allowed);
        assert_eq!(eval.clock_skew, Some(3.0));
        // No refill credit and the stored timestamp does not move backwards
        assert_eq!(
            eval.next,
            KeyState::Bucket(BucketState {
                available: Tokens::ZERO,
                last_refill: at(10.0)
            })
        );
    }

    #[test]
    fn test_leaky_first_request_starts_empty() {
        let policy = policy(Algorithm::Leaky, 5.0, 1.0);
        let eval = policy.evaluate(None, at(0.0));

        assert!(eval.allowed);
        assert_eq!(
            eval.next,
            KeyState::Level(LevelState {
                level: Tokens::ONE,
                last_leak: at(0.0)
            })
        );
    }

    #[test]
    fn test_leaky_rejection_keeps_level() {
        let policy = policy(Algorithm::Leaky, 2.0, 1.0);
        let full = KeyState::Level(LevelState {
            level: tokens(2.0),
            last_leak: at(0.0),
        });

        let eval = policy.evaluate(Some(&full), at(0.25));
        assert!(!eval.allowed);
        assert_eq!(
            eval.next,
            KeyState::Level(LevelState {
                level: tokens(1.75),
                last_leak: at(0.25)
            })
        );
        assert_eq!(eval.retry_after, Some(Duration::from_millis(750)));
    }

    #[test]
    fn test_leaky_never_drains_below_zero() {
        let policy = policy(Algorithm::Leaky, 5.0, 2.0);
        let state = KeyState::Level(LevelState {
            level: Tokens::ONE,
            last_leak: at(0.0),
        });

        let eval = policy.evaluate(Some(&state), at(60.0));
        assert!(eval.allowed);
        assert_eq!(
            eval.next,
            KeyState::Level(LevelState {
                level: Tokens::ONE,
                last_leak: at(60.0)
            })
        );
    }

    #[test]
    fn test_foreign_state_is_replaced() {
        let policy = policy(Algorithm::Leaky, 5.0, 1.0);
        let token_state = KeyState::Bucket(BucketState {
            available: Tokens::ZERO,
            last_refill: at(0.0),
        });

        let eval = policy.evaluate(Some(&token_state), at(1.0));
        assert!(eval.allowed);
        assert!(eval.replaced_foreign_state);
        assert!(matches!(eval.next, KeyState::Level(_)));
    }

    #[test]
    fn test_time_to_rest() {
        assert_eq!(
            policy(Algorithm::Token, 10.0, 2.0).time_to_rest(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(policy(Algorithm::Leaky, 10.0, 0.0).time_to_rest(), None);
        assert_eq!(
            policy(Algorithm::Token, 0.0, 0.0).time_to_rest(),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_decimal_timings_keep_buckets_in_step() {
        let mut rng = StdRng::seed_from_u64(2024);
        let rates = [0.1, 0.2, 0.3, 0.6, 0.7, 1.3, 2.5];

        for round in 0..2000 {
            let capacity = rng.gen_range(1..=6) as f64;
            let rate = rates[rng.gen_range(0..rates.len())];
            let token = policy(Algorithm::Token, capacity, rate);
            let leaky = policy(Algorithm::Leaky, capacity, rate);

            let mut token_state = None;
            let mut leaky_state = None;
            let mut tenths = 0u64;

            for request in 0..200 {
                tenths += rng.gen_range(0..8);
                let now = Timestamp::from_nanos(tenths * 100_000_000);

                let a = token.evaluate(token_state.as_ref(), now);
                let b = leaky.evaluate(leaky_state.as_ref(), now);
                assert_eq!(
                    (a.allowed, a.retry_after),
                    (b.allowed, b.retry_after),
                    "round {round} (capacity {capacity}, rate {rate}), request {request} at {now}"
                );

                match (a.next, b.next) {
                    (KeyState::Bucket(t), KeyState::Level(l)) => {
                        assert_eq!(t.available.as_units() + l.level.as_units(), token.capacity().as_units());
                    }
                    other => panic!("unexpected state kinds {:?}", other),
                }
                token_state = Some(a.next);
                leaky_state = Some(b.next);
            }
        }
    }
}
