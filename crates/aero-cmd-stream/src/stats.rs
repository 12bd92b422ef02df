use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide counters shared by every stream.
///
/// `messages_processed` doubles as the activity signal the scheduler samples to decide whether
/// a poll is idle.
#[derive(Debug, Default)]
pub struct ProcessStats {
    messages_processed: AtomicU64,
    commands_processed: AtomicU64,
    idle_passes: AtomicU64,
    flushes_dropped: AtomicU64,
    contexts_lost: AtomicU64,
    virtual_context_switches: AtomicU64,
    streams_created: AtomicU64,
    streams_destroyed: AtomicU64,
    sync_points_force_retired: AtomicU64,
    out_of_memory_errors: AtomicU64,
}

impl ProcessStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    pub fn inc_messages_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commands_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_idle_passes(&self) {
        self.idle_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flushes_dropped(&self) {
        self.flushes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_contexts_lost(&self) {
        self.contexts_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_virtual_context_switches(&self) {
        self.virtual_context_switches
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_streams_created(&self) {
        self.streams_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_streams_destroyed(&self) {
        self.streams_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sync_points_force_retired(&self, count: u64) {
        self.sync_points_force_retired
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_out_of_memory_errors(&self) {
        self.out_of_memory_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProcessStatsSnapshot {
        ProcessStatsSnapshot {
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            commands_processed: self.commands_processed.load(Ordering::Relaxed),
            idle_passes: self.idle_passes.load(Ordering::Relaxed),
            flushes_dropped: self.flushes_dropped.load(Ordering::Relaxed),
            contexts_lost: self.contexts_lost.load(Ordering::Relaxed),
            virtual_context_switches: self.virtual_context_switches.load(Ordering::Relaxed),
            streams_created: self.streams_created.load(Ordering::Relaxed),
            streams_destroyed: self.streams_destroyed.load(Ordering::Relaxed),
            sync_points_force_retired: self.sync_points_force_retired.load(Ordering::Relaxed),
            out_of_memory_errors: self.out_of_memory_errors.load(Ordering::Relaxed),
        }
    }

    pub fn to_json(&self) -> String {
        self.snapshot().to_json()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProcessStatsSnapshot {
    pub messages_processed: u64,
    pub commands_processed: u64,
    pub idle_passes: u64,
    pub flushes_dropped: u64,
    pub contexts_lost: u64,
    pub virtual_context_switches: u64,
    pub streams_created: u64,
    pub streams_destroyed: u64,
    pub sync_points_force_retired: u64,
    pub out_of_memory_errors: u64,
}

impl ProcessStatsSnapshot {
    pub fn to_json(self) -> String {
        // Plain integer fields cannot fail to serialize.
        serde_json::to_string(&self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_json_contains_counters() {
        let stats = ProcessStats::new();
        stats.inc_messages_processed();
        stats.inc_messages_processed();
        stats.inc_flushes_dropped();
        stats.add_sync_points_force_retired(3);
        let json = stats.to_json();
        assert!(json.contains("\"messages_processed\":2"));
        assert!(json.contains("\"flushes_dropped\":1"));
        assert!(json.contains("\"sync_points_force_retired\":3"));
        assert!(json.contains("\"contexts_lost\":0"));
    }
}
