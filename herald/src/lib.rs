//! herald library crate.
//!
//! Event dispatch with per-channel retry and a durable file-backed job queue.

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod notification;
pub mod queue;
pub mod service;

pub use error::{Error, Result};
pub use service::{HealthReport, Herald, HeraldStats};
