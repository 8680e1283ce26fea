//! Types library for the explorer data layer
//!
//! Shared vocabulary between the streaming cache engine, its producers, and
//! the collections built on top of it.
//!
//! # Modules
//! - `ids`: Stream identifiers and registry scope keys
//! - `state`: Fetch lifecycle states
//! - `period`: Time-aggregation granularities
//! - `record`: Capabilities a record type exposes to the summary layer
//! - `errors`: Error taxonomy

pub mod ids;
pub mod state;
pub mod period;
pub mod record;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::state::*;
    pub use crate::period::*;
    pub use crate::record::*;
    pub use crate::errors::*;
}
