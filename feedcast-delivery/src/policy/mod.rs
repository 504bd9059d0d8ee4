//! Retry and fairness policy.

pub mod backoff;
pub mod fairness;

pub use backoff::BackoffPolicy;
pub use fairness::FairnessWindow;
