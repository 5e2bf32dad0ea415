//! Real-time order book synchronization.
//!
//! Merges a REST depth snapshot with an incremental diff stream into a
//! locally consistent book, keeps the stream connection alive across drops,
//! and publishes an aggregated depth view with wall detection.

pub mod circuit_breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod market_data;
pub mod net;
pub mod telemetry;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use market_data::{BookStatus, BookSubscription, DepthFeed};
