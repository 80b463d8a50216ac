//! Domain value objects.
//!
//! Value objects are immutable objects that represent concepts in the domain
//! and are defined by their attributes rather than identity.

mod priority;
mod retry_policy;

pub use priority::Priority;
pub use retry_policy::{MAX_JITTER, RetryPolicy};
