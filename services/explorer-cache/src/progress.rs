//! Progress signalling for streaming views
//!
//! A view can hold far fewer items than its store (filters), so progress is
//! driven by how many items the view has accepted, not by store counts.
//! The first signal fires once a UI page is available; after that, one
//! signal per `every` items keeps the indicator moving without flooding it.

use crate::config::FacetConfig;

#[derive(Debug, Clone)]
pub struct ProgressTracker {
    first_page: usize,
    every: usize,
    seen: usize,
}

impl ProgressTracker {
    pub fn new(first_page: usize, every: usize) -> Self {
        Self {
            first_page: first_page.max(1),
            every: every.max(1),
            seen: 0,
        }
    }

    pub fn from_config(config: &FacetConfig) -> Self {
        Self::new(config.progress_first_page, config.progress_every)
    }

    /// Count one accepted item. Returns the running count when a progress
    /// signal is due.
    pub fn advance(&mut self) -> Option<usize> {
        self.seen += 1;
        let due = self.seen == self.first_page
            || (self.seen > self.first_page && (self.seen - self.first_page) % self.every == 0);
        due.then_some(self.seen)
    }

    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn reset(&mut self) {
        self.seen = 0;
    }
}
