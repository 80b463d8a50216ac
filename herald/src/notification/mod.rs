//! Event dispatch.
//!
//! Delivers events to notification channels, either inline or through the
//! durable queue.
//!
//! # Features
//!
//! - Concurrent fan-out to every channel of an event type
//! - Retry with exponential backoff and jitter
//! - First-healthy provider selection per channel
//! - Short-lived result cache for callers waiting on queued events
//!
//! # Example
//!
//! ```ignore
//! use herald::notification::{EmitOptions, Emitter};
//!
//! let result = emitter
//!     .emit("user.welcome", json!({"userId": 123}), EmitOptions::default())
//!     .await?;
//! println!("queued {} at {:?}", result.event_id, result.queued_at);
//! ```

pub mod channels;
pub mod emitter;
pub mod processor;
pub mod provider;
pub mod result_store;
pub mod retry;
pub mod router;

pub use emitter::{EmitMode, EmitOptions, Emitter};
pub use processor::{EventJobProcessor, QueuedEvent};
pub use provider::ChannelProvider;
pub use result_store::{DEFAULT_RESULT_TTL, ResultStore, ResultStoreStats};
pub use retry::{RetryExecutor, RetryOutcome, is_retryable, is_retryable_message, is_retryable_status};
pub use router::{ProviderHealth, Router};
