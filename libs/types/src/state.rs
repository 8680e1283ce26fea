//! Fetch lifecycle states
//!
//! ```text
//! Stale ──fetch──▶ Fetching ──ok / partial──▶ Loaded
//!   ▲                 │
//!   └──error, 0 items─┘        reset: * ──▶ Stale
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Load state of a store, as seen by every facet reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    /// Nothing cached, or the cache was invalidated. A fetch is needed.
    #[default]
    Stale,
    /// A stream is currently being drained into the store.
    Fetching,
    /// The last fetch completed, possibly partially.
    Loaded,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::Stale => "stale",
            LoadState::Fetching => "fetching",
            LoadState::Loaded => "loaded",
        }
    }

    /// Whether the state means any view of the data must be discarded.
    pub fn invalidates_view(&self) -> bool {
        matches!(self, LoadState::Stale | LoadState::Fetching)
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
