//! Rate Limiter (§4.7): admission algorithms plus the striped,
//! idle-swept limiter that owns their state.

pub mod algorithms;
pub mod limiter;

pub use algorithms::AdmissionResult;
pub use limiter::{derive_key, RateLimiter};
