//! Source system implementations
//!
//! `MemorySource` holds fact tables as Arrow batches (loaded from CSV with
//! [`load_csv`]) and answers the proxy's aggregation statements and freshness
//! probes locally.

pub mod csv;
pub mod memory;

pub use csv::load_csv;
pub use memory::MemorySource;
