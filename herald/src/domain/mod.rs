//! Domain layer: events, delivery outcomes and value objects.

pub mod event;
pub mod notification;
pub mod value_objects;

pub use event::{DeliveryContext, Event};
pub use notification::{
    DeliveryStatus, EventEmissionResult, NO_HEALTHY_PROVIDER, NotificationResult, ProcessingMode,
    TIMEOUT_ERROR, UNKNOWN_CHANNEL,
};
pub use value_objects::{Priority, RetryPolicy};
