use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Engine outcome counters
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub dossiers_provisioned: AtomicU64,
    pub duplicate_signals: AtomicU64,
    pub provisioning_conflicts: AtomicU64,
    pub events_dropped: AtomicU64,
    pub notifications_dropped: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_provisioned(&self) {
        self.dossiers_provisioned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_signal(&self) {
        self.duplicate_signals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_provisioning_conflict(&self) {
        self.provisioning_conflicts.fetch_add(1, Ordering::Relaxed);
        warn!("Concurrent provisioning detected, linked to existing dossier");
    }

    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification_dropped(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            dossiers_provisioned: self.dossiers_provisioned.load(Ordering::Relaxed),
            duplicate_signals: self.duplicate_signals.load(Ordering::Relaxed),
            provisioning_conflicts: self.provisioning_conflicts.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Engine metrics: provisioned={}, duplicates={}, conflicts={}, events_dropped={}, notifications_dropped={}",
            stats.dossiers_provisioned,
            stats.duplicate_signals,
            stats.provisioning_conflicts,
            stats.events_dropped,
            stats.notifications_dropped
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub dossiers_provisioned: u64,
    pub duplicate_signals: u64,
    pub provisioning_conflicts: u64,
    pub events_dropped: u64,
    pub notifications_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = EngineMetrics::new();
        metrics.record_provisioned();
        metrics.record_duplicate_signal();
        metrics.record_duplicate_signal();
        metrics.record_event_dropped();

        let stats = metrics.get_stats();
        assert_eq!(stats.dossiers_provisioned, 1);
        assert_eq!(stats.duplicate_signals, 2);
        assert_eq!(stats.events_dropped, 1);
        assert_eq!(stats.notifications_dropped, 0);
    }
}
