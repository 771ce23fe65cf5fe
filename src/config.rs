//! Centralized configuration and builder for StrataDB.
//!
//! - StrataConfig::from_env() reads STRATA_* variables (booleans accept 1|true|yes|on).
//! - StrataBuilder starts from env (or from a clean default) and allows overrides.
//!
//! Durability-oriented defaults:
//! - wal_sync_on_commit = true (AtomicUnitEnd is fsync'ed before commit returns)
//! - wal_fsync = true (set false only in tests / scratch storages)
//! - data_fsync = true (data files are fsync'ed on checkpoints)

use std::fmt;

use crate::consts::{
    DEFAULT_INDEX_BUCKETS, DEFAULT_PAGE_SIZE, DEFAULT_RECORD_LOCK_STRIPES,
    DEFAULT_WAL_SEGMENT_SIZE,
};

#[derive(Clone, Debug)]
pub struct StrataConfig {
    /// Page size in bytes for newly created storages (existing ones keep theirs).
    /// Env: STRATA_PAGE_SIZE (default 8192)
    pub page_size: u32,

    /// WAL segment size threshold; the log rolls over to a new segment past it.
    /// Env: STRATA_WAL_SEGMENT_SIZE (default 64 MiB)
    pub wal_segment_size: u64,

    /// Records fetched per WAL read during recovery.
    /// Env: STRATA_WAL_READ_BATCH (default 1000)
    pub wal_read_batch: usize,

    /// fsync the WAL when an atomic operation commits.
    /// Env: STRATA_WAL_SYNC_ON_COMMIT (default true)
    pub wal_sync_on_commit: bool,

    /// Master switch for WAL fsync calls.
    /// Env: STRATA_WAL_FSYNC (default true)
    pub wal_fsync: bool,

    /// fsync data files when pages are flushed by checkpoints.
    /// Env: STRATA_DATA_FSYNC (default true)
    pub data_fsync: bool,

    /// Clean-page read cache capacity in pages (0 disables).
    /// Env: STRATA_READ_CACHE_PAGES (default 1024)
    pub read_cache_pages: usize,

    /// Size of the striped per-record lock pool.
    /// Env: STRATA_RECORD_LOCK_STRIPES (default 64)
    pub record_lock_stripes: usize,

    /// Bucket count for newly created hash index engines.
    /// Env: STRATA_INDEX_BUCKETS (default 64)
    pub index_buckets: u32,

    /// Upper bound on fuzzy-checkpoint rounds per WAL vacuum run.
    /// Env: STRATA_VACUUM_MAX_ROUNDS (default 8)
    pub vacuum_max_rounds: u32,

    /// Bounded wait for the state lock by the fuzzy-checkpoint driver (ms).
    /// Env: STRATA_STATE_LOCK_POLL_MS (default 100)
    pub state_lock_poll_ms: u64,

    /// Recovery progress is logged every N records (0 disables).
    /// Env: STRATA_RESTORE_REPORT_INTERVAL (default 10000)
    pub restore_report_interval: u64,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            wal_segment_size: DEFAULT_WAL_SEGMENT_SIZE,
            wal_read_batch: 1000,
            wal_sync_on_commit: true,
            wal_fsync: true,
            data_fsync: true,
            read_cache_pages: 1024,
            record_lock_stripes: DEFAULT_RECORD_LOCK_STRIPES,
            index_buckets: DEFAULT_INDEX_BUCKETS,
            vacuum_max_rounds: 8,
            state_lock_poll_ms: 100,
            restore_report_interval: 10_000,
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "yes" || s == "on"
    })
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl StrataConfig {
    /// Load configuration from environment variables on top of defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(n) = env_parse::<u32>("STRATA_PAGE_SIZE") {
            cfg.page_size = n;
        }
        if let Some(n) = env_parse::<u64>("STRATA_WAL_SEGMENT_SIZE") {
            cfg.wal_segment_size = n;
        }
        if let Some(n) = env_parse::<usize>("STRATA_WAL_READ_BATCH") {
            cfg.wal_read_batch = n.max(1);
        }
        if let Some(b) = env_bool("STRATA_WAL_SYNC_ON_COMMIT") {
            cfg.wal_sync_on_commit = b;
        }
        if let Some(b) = env_bool("STRATA_WAL_FSYNC") {
            cfg.wal_fsync = b;
        }
        if let Some(b) = env_bool("STRATA_DATA_FSYNC") {
            cfg.data_fsync = b;
        }
        if let Some(n) = env_parse::<usize>("STRATA_READ_CACHE_PAGES") {
            cfg.read_cache_pages = n;
        }
        if let Some(n) = env_parse::<usize>("STRATA_RECORD_LOCK_STRIPES") {
            cfg.record_lock_stripes = n.max(1);
        }
        if let Some(n) = env_parse::<u32>("STRATA_INDEX_BUCKETS") {
            cfg.index_buckets = n.max(1);
        }
        if let Some(n) = env_parse::<u32>("STRATA_VACUUM_MAX_ROUNDS") {
            cfg.vacuum_max_rounds = n.max(1);
        }
        if let Some(n) = env_parse::<u64>("STRATA_STATE_LOCK_POLL_MS") {
            cfg.state_lock_poll_ms = n;
        }
        if let Some(n) = env_parse::<u64>("STRATA_RESTORE_REPORT_INTERVAL") {
            cfg.restore_report_interval = n;
        }

        cfg
    }

    pub fn with_page_size(mut self, ps: u32) -> Self {
        self.page_size = ps;
        self
    }

    pub fn with_wal_segment_size(mut self, bytes: u64) -> Self {
        self.wal_segment_size = bytes;
        self
    }

    pub fn with_wal_read_batch(mut self, n: usize) -> Self {
        self.wal_read_batch = n.max(1);
        self
    }

    pub fn with_wal_sync_on_commit(mut self, on: bool) -> Self {
        self.wal_sync_on_commit = on;
        self
    }

    pub fn with_wal_fsync(mut self, on: bool) -> Self {
        self.wal_fsync = on;
        self
    }

    pub fn with_data_fsync(mut self, on: bool) -> Self {
        self.data_fsync = on;
        self
    }

    pub fn with_read_cache_pages(mut self, pages: usize) -> Self {
        self.read_cache_pages = pages;
        self
    }

    pub fn with_record_lock_stripes(mut self, n: usize) -> Self {
        self.record_lock_stripes = n.max(1);
        self
    }

    pub fn with_index_buckets(mut self, n: u32) -> Self {
        self.index_buckets = n.max(1);
        self
    }

    pub fn with_vacuum_max_rounds(mut self, n: u32) -> Self {
        self.vacuum_max_rounds = n.max(1);
        self
    }

    pub fn with_state_lock_poll_ms(mut self, ms: u64) -> Self {
        self.state_lock_poll_ms = ms;
        self
    }

    pub fn with_restore_report_interval(mut self, n: u64) -> Self {
        self.restore_report_interval = n;
        self
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> Self {
        self
    }
}

impl fmt::Display for StrataConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StrataConfig {{ \
             page_size: {}, \
             wal_segment_size: {}, \
             wal_read_batch: {}, \
             wal_sync_on_commit: {}, \
             wal_fsync: {}, \
             data_fsync: {}, \
             read_cache_pages: {}, \
             record_lock_stripes: {}, \
             index_buckets: {}, \
             vacuum_max_rounds: {}, \
             state_lock_poll_ms: {}, \
             restore_report_interval: {} \
             }}",
            self.page_size,
            self.wal_segment_size,
            self.wal_read_batch,
            self.wal_sync_on_commit,
            self.wal_fsync,
            self.data_fsync,
            self.read_cache_pages,
            self.record_lock_stripes,
            self.index_buckets,
            self.vacuum_max_rounds,
            self.state_lock_poll_ms,
            self.restore_report_interval,
        )
    }
}

/// Builder producing a StrataConfig; `StorageEngine::builder()` returns one.
#[derive(Clone, Debug)]
pub struct StrataBuilder {
    cfg: StrataConfig,
}

impl Default for StrataBuilder {
    fn default() -> Self {
        Self {
            cfg: StrataConfig::from_env(),
        }
    }
}

impl StrataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a clean default (without reading env).
    pub fn from_default() -> Self {
        Self {
            cfg: StrataConfig::default(),
        }
    }

    pub fn page_size(mut self, ps: u32) -> Self {
        self.cfg.page_size = ps;
        self
    }

    pub fn wal_segment_size(mut self, bytes: u64) -> Self {
        self.cfg.wal_segment_size = bytes;
        self
    }

    pub fn wal_sync_on_commit(mut self, on: bool) -> Self {
        self.cfg.wal_sync_on_commit = on;
        self
    }

    pub fn wal_fsync(mut self, on: bool) -> Self {
        self.cfg.wal_fsync = on;
        self
    }

    pub fn data_fsync(mut self, on: bool) -> Self {
        self.cfg.data_fsync = on;
        self
    }

    pub fn read_cache_pages(mut self, pages: usize) -> Self {
        self.cfg.read_cache_pages = pages;
        self
    }

    pub fn record_lock_stripes(mut self, n: usize) -> Self {
        self.cfg.record_lock_stripes = n.max(1);
        self
    }

    pub fn index_buckets(mut self, n: u32) -> Self {
        self.cfg.index_buckets = n.max(1);
        self
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> StrataConfig {
        self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = StrataBuilder::from_default()
            .page_size(4096)
            .wal_segment_size(1 << 20)
            .wal_fsync(false)
            .record_lock_stripes(0)
            .build();
        assert_eq!(cfg.page_size, 4096);
        assert_eq!(cfg.wal_segment_size, 1 << 20);
        assert!(!cfg.wal_fsync);
        assert_eq!(cfg.record_lock_stripes, 1);
        assert!(cfg.wal_sync_on_commit);
        assert!(cfg.to_string().contains("page_size: 4096"));
    }
}
