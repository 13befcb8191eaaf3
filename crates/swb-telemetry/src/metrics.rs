// SPDX-License-Identifier: MIT OR Apache-2.0
//! Thread-safe counters keyed by broker event name.
//!
//! The composition root's event pump records every [`BrokerEvent`] it pulls
//! off the bus, so the counters reflect everything any component published.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::BrokerEvent;

/// Thread-safe collector counting broker events by wire name.
///
/// Clone freely: clones share the same underlying counters.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    counts: Arc<Mutex<BTreeMap<&'static str, u64>>>,
}

impl MetricsCollector {
    /// Create a new, empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence of `event`.
    pub fn record(&self, event: &BrokerEvent) {
        let mut counts = self.counts.lock().expect("metrics lock poisoned");
        *counts.entry(event.name()).or_insert(0) += 1;
    }

    /// Record one occurrence by bare name (for events synthesized outside
    /// the [`BrokerEvent`] taxonomy in tests or shims).
    pub fn record_name(&self, name: &'static str) {
        let mut counts = self.counts.lock().expect("metrics lock poisoned");
        *counts.entry(name).or_insert(0) += 1;
    }

    /// Current count for a single event name.
    #[must_use]
    pub fn count(&self, name: &str) -> u64 {
        self.counts
            .lock()
            .expect("metrics lock poisoned")
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of every counter, deterministically ordered.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        self.counts.lock().expect("metrics lock poisoned").clone()
    }

    /// Total events recorded across all names.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts
            .lock()
            .expect("metrics lock poisoned")
            .values()
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_increments_by_name() {
        let metrics = MetricsCollector::new();
        let event = BrokerEvent::BackendConnected {
            session_id: "s-1".into(),
            adapter: "acp".into(),
        };
        metrics.record(&event);
        metrics.record(&event);
        assert_eq!(metrics.count("backend:connected"), 2);
        assert_eq!(metrics.count("backend:disconnected"), 0);
        assert_eq!(metrics.total(), 2);
    }

    #[test]
    fn clones_share_counters() {
        let metrics = MetricsCollector::new();
        let clone = metrics.clone();
        clone.record_name("error");
        assert_eq!(metrics.count("error"), 1);
    }

    #[test]
    fn snapshot_is_sorted() {
        let metrics = MetricsCollector::new();
        metrics.record_name("z");
        metrics.record_name("a");
        let names: Vec<_> = metrics.snapshot().keys().copied().collect();
        assert_eq!(names, vec!["a", "z"]);
    }
}
