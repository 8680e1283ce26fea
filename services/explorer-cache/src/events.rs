//! Notifications emitted by facets to UI listeners
//!
//! Delivered over a broadcast channel; a listener that falls behind loses
//! the oldest events rather than blocking the facet.

use serde::{Deserialize, Serialize};

use crate::summary::SummarySnapshot;

/// Facet notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum FacetEvent {
    /// Incremental progress while a fetch runs.
    Progress {
        facet: String,
        current: usize,
        /// Producer-reported total for the whole store, 0 when unknown.
        expected: usize,
    },

    /// The store finished loading and the view was resynchronized.
    Loaded {
        facet: String,
        count: usize,
        summary: Option<SummarySnapshot>,
    },

    /// A background fetch failed.
    Error { facet: String, message: String },
}

impl FacetEvent {
    pub fn facet(&self) -> &str {
        match self {
            FacetEvent::Progress { facet, .. }
            | FacetEvent::Loaded { facet, .. }
            | FacetEvent::Error { facet, .. } => facet,
        }
    }

    pub fn event_type_label(&self) -> &'static str {
        match self {
            FacetEvent::Progress { .. } => "progress",
            FacetEvent::Loaded { .. } => "loaded",
            FacetEvent::Error { .. } => "error",
        }
    }
}
