//! Quotamesh - Distributed Quota Enforcement
//!
//! This crate enforces per-client token-bucket quotas consistently across
//! service instances sharing one bucket store. Quota profiles are versioned
//! and hot-reloadable: updates are published on an event bus, and live
//! buckets pick up a changed profile on their next access.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod keys;
pub mod ratelimit;
pub mod reload;
pub mod store;

pub use engine::QuotaEngine;
pub use error::{QuotaError, Result};
