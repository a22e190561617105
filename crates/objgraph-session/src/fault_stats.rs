//! Fault firing statistics.
//!
//! Firing the same relationship fault once per object in a loop issues one
//! query per object. This tracker counts firings per (entity, relationship)
//! and warns once the count reaches a threshold, pointing at prefetching as
//! the fix.

use std::collections::HashMap;

/// Counts fault firings per relationship.
#[derive(Debug, Clone, Default)]
pub struct FaultStats {
    /// (entity, relationship) -> firings
    counts: HashMap<(String, String), usize>,
    /// Warn when a single relationship reaches this many firings
    threshold: Option<usize>,
}

/// Summary of recorded firings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultSummary {
    /// Total number of fault firings recorded
    pub total_fired: usize,
    /// Number of distinct relationships fired
    pub relationships: usize,
    /// Relationships at or above the threshold
    pub hot: usize,
}

impl FaultStats {
    pub fn new(threshold: Option<usize>) -> Self {
        Self {
            counts: HashMap::new(),
            threshold,
        }
    }

    pub fn threshold(&self) -> Option<usize> {
        self.threshold
    }

    /// Record one firing.
    pub fn record(&mut self, entity: &str, relationship: &str) {
        let count = self
            .counts
            .entry((entity.to_string(), relationship.to_string()))
            .or_insert(0);
        *count += 1;

        if Some(*count) == self.threshold {
            tracing::warn!(
                target: "objgraph::faults",
                entity = entity,
                relationship = relationship,
                fired = *count,
                "Relationship fault fired once per object; consider prefetching it"
            );
        }
    }

    /// Firings recorded for one relationship.
    pub fn count_for(&self, entity: &str, relationship: &str) -> usize {
        self.counts
            .get(&(entity.to_string(), relationship.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn summary(&self) -> FaultSummary {
        FaultSummary {
            total_fired: self.counts.values().sum(),
            relationships: self.counts.len(),
            hot: self
                .threshold
                .map_or(0, |t| self.counts.values().filter(|c| **c >= t).count()),
        }
    }

    /// Forget all counts.
    pub fn reset(&mut self) {
        self.counts.clear();
    }
}
