//! Explorer Cache Engine
//!
//! Streaming, observable in-memory cache for explorer data:
//! - Stream context registry with supersede-on-register cancellation
//! - Generic stores fed by streaming producers
//! - Filtered, deduplicated, paginated facets over a shared store
//! - Period summaries (hourly through annual) of flows and balances
//! - Block-range chart buckets with per-series statistics
//! - A registry of stores and facets keyed by kind and scope
//!
//! # Architecture
//!
//! ```text
//!      Producer (blocking query)
//!             │  StreamSink
//!        ┌────▼─────┐     ┌────────────────┐
//!        │  Store   │◀────│ ContextManager │  one live stream per key
//!        └────┬─────┘     └────────────────┘
//!             │ on_new_item / on_state_changed
//!      ┌──────┼──────────┐
//!   ┌──▼──┐ ┌─▼───┐  ┌───▼──┐
//!   │Facet│ │Facet│  │Facet │  filter, dedup, pages
//!   └──┬──┘ └──┬──┘  └──┬───┘
//!      │       │        │
//!   Summaries  Buckets  FacetEvent broadcast
//! ```
//!
//! Stores and facets are shared through [`Registry`], which also owns the
//! [`ContextManager`] their streams register with.

pub mod buckets;
pub mod config;
pub mod context;
pub mod events;
pub mod facet;
pub mod progress;
pub mod registry;
pub mod store;
pub mod summary;

pub use buckets::{Bucket, BucketStats, Buckets, GridInfo};
pub use config::{BucketConfig, CacheConfig, FacetConfig};
pub use context::{ContextManager, StreamHandle, StreamSink};
pub use events::FacetEvent;
pub use facet::{Facet, FacetBuilder, Page, SortOrder, SortSpec};
pub use registry::Registry;
pub use store::{FetchTicket, Observer, ProducerError, Store};
pub use summary::{PeriodAccumulator, SummaryAccumulator, SummaryManager, SummarySnapshot};

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
