//! Operation counters for monitoring store and listener activity.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Engine-wide counters. Cheap to share and update from any task.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// Successful data writes
    pub saves: AtomicU64,
    /// Successful data reads
    pub loads: AtomicU64,
    /// Soft and permanent deletes
    pub deletes: AtomicU64,
    /// Events pushed to the index queue
    pub index_events: AtomicU64,
    /// Events pushed to the backup queue
    pub backup_events: AtomicU64,
    /// Batches dispatched to indexers
    pub dispatched_batches: AtomicU64,
    /// Batches that failed dispatch and were left for redelivery
    pub dispatch_failures: AtomicU64,
    /// Logical bytes written
    pub bytes_written: AtomicU64,
    /// Event emission failures (writes themselves succeeded)
    pub event_failures: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub saves: u64,
    pub loads: u64,
    pub deletes: u64,
    pub index_events: u64,
    pub backup_events: u64,
    pub dispatched_batches: u64,
    pub dispatch_failures: u64,
    pub bytes_written: u64,
    pub event_failures: u64,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_save(&self, logical_bytes: u64) {
        self.saves.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(logical_bytes, Ordering::Relaxed);
    }

    pub fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_index_event(&self) {
        self.index_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backup_event(&self) {
        self.backup_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.dispatched_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_failure(&self) {
        self.event_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            saves: self.saves.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            index_events: self.index_events.load(Ordering::Relaxed),
            backup_events: self.backup_events.load(Ordering::Relaxed),
            dispatched_batches: self.dispatched_batches.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            event_failures: self.event_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_reflects_recorded_operations() {
        let metrics = StoreMetrics::new();
        metrics.record_save(1024);
        metrics.record_save(10);
        metrics.record_load();
        metrics.record_index_event();

        let report = metrics.report();
        assert_eq!(report.saves, 2);
        assert_eq!(report.bytes_written, 1034);
        assert_eq!(report.loads, 1);
        assert_eq!(report.index_events, 1);
        assert_eq!(report.dispatch_failures, 0);
    }
}
