//! Rate limiting logic and state management.

mod admission;
mod algorithm;
mod backend;
mod key;
mod limiter;
mod state;

pub use admission::AdmissionFacade;
pub use algorithm::{Algorithm, Evaluation, Policy};
pub use backend::{AdmissionControl, Decision};
pub use key::{RateLimitKey, ANONYMOUS};
pub use limiter::{RateLimiter, Verdict};
pub use state::{BucketState, KeyState, LevelState, Tokens, UNITS_PER_TOKEN};
