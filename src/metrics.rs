//! Per-engine metrics.
//!
//! Потокобезопасные атомарные счётчики, принадлежащие конкретному StorageEngine
//! (никаких процесс-глобальных static). Подсистемы:
//! - WAL
//! - Atomic operations / commit
//! - Recovery
//! - Checkpoints / vacuum

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StorageMetrics {
    // ----- WAL -----
    wal_appends_total: AtomicU64,
    wal_bytes_written: AtomicU64,
    wal_fsync_calls: AtomicU64,
    wal_segments_cut: AtomicU64,

    // ----- Atomic operations -----
    atomic_ops_committed: AtomicU64,
    atomic_ops_rolled_back: AtomicU64,
    tx_commits: AtomicU64,
    tx_conflicts: AtomicU64,

    // ----- Recovery -----
    recovery_records_read: AtomicU64,
    recovery_units_applied: AtomicU64,
    recovery_units_discarded: AtomicU64,

    // ----- Checkpoints -----
    fuzzy_checkpoints: AtomicU64,
    full_checkpoints: AtomicU64,
    vacuum_runs: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub wal_appends_total: u64,
    pub wal_bytes_written: u64,
    pub wal_fsync_calls: u64,
    pub wal_segments_cut: u64,

    pub atomic_ops_committed: u64,
    pub atomic_ops_rolled_back: u64,
    pub tx_commits: u64,
    pub tx_conflicts: u64,

    pub recovery_records_read: u64,
    pub recovery_units_applied: u64,
    pub recovery_units_discarded: u64,

    pub fuzzy_checkpoints: u64,
    pub full_checkpoints: u64,
    pub vacuum_runs: u64,
}

impl MetricsSnapshot {
    pub fn avg_wal_record_bytes(&self) -> f64 {
        if self.wal_appends_total == 0 {
            0.0
        } else {
            self.wal_bytes_written as f64 / self.wal_appends_total as f64
        }
    }

    pub fn conflict_ratio(&self) -> f64 {
        let total = self.tx_commits + self.tx_conflicts;
        if total == 0 {
            0.0
        } else {
            self.tx_conflicts as f64 / total as f64
        }
    }
}

#[inline]
fn bump(c: &AtomicU64, n: u64) {
    c.fetch_add(n, Ordering::Relaxed);
}

impl StorageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ----- WAL -----
    pub fn record_wal_append(&self, frame_len: usize) {
        bump(&self.wal_appends_total, 1);
        bump(&self.wal_bytes_written, frame_len as u64);
    }
    pub fn record_wal_fsync(&self) {
        bump(&self.wal_fsync_calls, 1);
    }
    pub fn record_wal_cut(&self, segments: usize) {
        bump(&self.wal_segments_cut, segments as u64);
    }

    // ----- Atomic operations -----
    pub fn record_atomic_commit(&self) {
        bump(&self.atomic_ops_committed, 1);
    }
    pub fn record_atomic_rollback(&self) {
        bump(&self.atomic_ops_rolled_back, 1);
    }
    pub fn record_tx_commit(&self) {
        bump(&self.tx_commits, 1);
    }
    pub fn record_tx_conflict(&self) {
        bump(&self.tx_conflicts, 1);
    }

    // ----- Recovery -----
    pub fn record_recovery(&self, records: u64, applied: u64, discarded: u64) {
        bump(&self.recovery_records_read, records);
        bump(&self.recovery_units_applied, applied);
        bump(&self.recovery_units_discarded, discarded);
    }

    // ----- Checkpoints -----
    pub fn record_fuzzy_checkpoint(&self) {
        bump(&self.fuzzy_checkpoints, 1);
    }
    pub fn record_full_checkpoint(&self) {
        bump(&self.full_checkpoints, 1);
    }
    pub fn record_vacuum_run(&self) {
        bump(&self.vacuum_runs, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let g = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            wal_appends_total: g(&self.wal_appends_total),
            wal_bytes_written: g(&self.wal_bytes_written),
            wal_fsync_calls: g(&self.wal_fsync_calls),
            wal_segments_cut: g(&self.wal_segments_cut),
            atomic_ops_committed: g(&self.atomic_ops_committed),
            atomic_ops_rolled_back: g(&self.atomic_ops_rolled_back),
            tx_commits: g(&self.tx_commits),
            tx_conflicts: g(&self.tx_conflicts),
            recovery_records_read: g(&self.recovery_records_read),
            recovery_units_applied: g(&self.recovery_units_applied),
            recovery_units_discarded: g(&self.recovery_units_discarded),
            fuzzy_checkpoints: g(&self.fuzzy_checkpoints),
            full_checkpoints: g(&self.full_checkpoints),
            vacuum_runs: g(&self.vacuum_runs),
        }
    }
}
