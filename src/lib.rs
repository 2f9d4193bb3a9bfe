//! polyroute - adaptive multi-provider request router
//!
//! This library provides the core routing engine: health monitoring,
//! feedback-driven weighting, predictive and geographic routing, cost
//! arbitrage, and the dispatcher that merges every signal into a ranked
//! provider list executed with fallback.

pub mod config;
pub mod cost;
pub mod dispatch;
pub mod error;
pub mod feedback;
pub mod geo;
pub mod health;
pub mod predict;
pub mod server;
pub mod storage;
pub mod transport;
pub mod weights;

pub use config::Config;
pub use error::{Error, Result};
