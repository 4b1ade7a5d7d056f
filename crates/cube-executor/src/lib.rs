//! Hypercube execution
//!
//! The embedded Arrow engine used for local aggregation and roll-up, the
//! Hypercube Manager that decides between cache and source, and the
//! `CubeService` that wires the cache components together.

pub mod aggregate;
pub mod engine;
pub mod manager;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::ArrowEngine;
pub use manager::{HypercubeManager, Resolution, ResolutionOrigin};
pub use service::{CubeMetrics, CubeService, Ping, ServiceConfig};
