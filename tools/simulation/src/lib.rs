//! Simulation & Load Testing for the Explorer Cache
//!
//! Deterministic synthetic data for exercising stores and facets without a
//! node: every generator and producer is seeded, so a given seed always
//! yields the same records in the same order.
//!
//! # Modules
//! - `records`: Synthetic transfer-like records and a seeded generator
//! - `producer`: Streaming producers with clean, failing and slow scenarios

pub mod producer;
pub mod records;

pub use producer::{Scenario, SyntheticProducer};
pub use records::{GeneratorConfig, RecordGenerator, SyntheticRecord};

/// Crate version constant
pub const VERSION: &str = "1.0.0";
