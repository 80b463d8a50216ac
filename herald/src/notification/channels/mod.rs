//! Reference channel providers.
//!
//! - Log sink (tracing)
//! - Generic webhooks (HTTP POST)

mod log;
mod webhook;

pub use log::LogProvider;
pub use webhook::{WebhookAuth, WebhookConfig, WebhookProvider, install_rustls_provider};
