//! engine — StorageEngine: публичная граница движка хранения.
//!
//! Подмодули (реализация разнесена по impl-блокам):
//! - open.rs        — create/open (с восстановлением), close/delete/crash, Drop.
//! - commit.rs      — commit транзакции, preallocate_rids, commit_pre_allocated.
//! - records.rs     — одиночные CRUD-операции над записями и чтение индексов.
//! - ddl.rs         — кластеры и индексные движки (под write-локом состояния).
//! - maintenance.rs — чекпоинты, check, freeze/release, битые страницы.
//!
//! Каждая публичная операция проходит через guard(): проверка липкой ошибки,
//! классификация ошибки, лог с correlation id, отравление при необходимости.

mod commit;
mod ddl;
mod maintenance;
mod open;
mod records;

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::atomic::AtomicOperationsManager;
use crate::cache::{BrokenPage, CacheReader, FilePageCache};
use crate::checkpoint::{Checkpointer, WalVacuum};
use crate::config::StrataConfig;
use crate::error::{ErrorState, StorageError, StorageResult};
use crate::lock::DirLock;
use crate::meta::StartupMeta;
use crate::metrics::{MetricsSnapshot, StorageMetrics};
use crate::recovery::RecoveryReport;
use crate::storage::{IndexEngine, PagedCluster, StateLock, StorageRegistry, StripedLocks};
use crate::wal::WriteAheadLog;

/// Компоненты хранилища; меняются только DDL-операциями под write-локом состояния.
pub(crate) struct Components {
    pub(crate) registry: StorageRegistry,
    pub(crate) clusters: BTreeMap<i32, PagedCluster>,
    pub(crate) indexes: BTreeMap<String, Arc<dyn IndexEngine>>,
}

impl Components {
    pub(crate) fn cluster(&self, id: i32) -> Result<&PagedCluster> {
        self.clusters
            .get(&id)
            .ok_or_else(|| StorageError::ClusterNotFound(format!("#{}", id)).into())
    }

    pub(crate) fn index(&self, name: &str) -> Result<&Arc<dyn IndexEngine>> {
        self.indexes
            .get(name)
            .ok_or_else(|| StorageError::IndexNotFound(name.to_string()).into())
    }
}

pub struct StorageEngine {
    root: PathBuf,
    cfg: StrataConfig,
    meta: StartupMeta,
    wal: Arc<WriteAheadLog>,
    cache: Arc<FilePageCache>,
    atomic: Arc<AtomicOperationsManager>,
    state: Arc<StateLock>,
    record_locks: StripedLocks,
    components: RwLock<Components>,
    checkpointer: Arc<Checkpointer>,
    vacuum: Mutex<Option<WalVacuum>>,
    errors: Arc<ErrorState>,
    metrics: Arc<StorageMetrics>,
    freeze_tokens: Mutex<Vec<u64>>,
    broken_pages: Mutex<Vec<BrokenPage>>,
    recovery: Option<RecoveryReport>,
    restored_after_open: bool,
    non_tx_in_previous_open: bool,
    closed: AtomicBool,
    _lock: DirLock,
}

impl StorageEngine {
    pub(crate) fn guard<T>(&self, op_name: &str, f: impl FnOnce() -> Result<T>) -> StorageResult<T> {
        self.errors.check()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::InvalidState(format!(
                "{}: storage {} is closed",
                op_name,
                self.root.display()
            )));
        }
        f().map_err(|e| self.errors.handle(op_name, e))
    }

    pub(crate) fn reader(&self) -> CacheReader<'_> {
        CacheReader(&*self.cache)
    }

    pub(crate) fn read_components(&self) -> Result<std::sync::RwLockReadGuard<'_, Components>> {
        self.components
            .read()
            .map_err(|_| anyhow!("components lock poisoned"))
    }

    pub(crate) fn write_components(&self) -> Result<std::sync::RwLockWriteGuard<'_, Components>> {
        self.components
            .write()
            .map_err(|_| anyhow!("components lock poisoned"))
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn config(&self) -> &StrataConfig {
        &self.cfg
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.meta.page_size as usize
    }

    pub fn instance_id(&self) -> String {
        self.meta.instance_id_hex()
    }

    /// Ok, пока хранилище не в состоянии ошибки.
    pub fn check_error_state(&self) -> StorageResult<()> {
        self.errors.check()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Метаданные последней закоммиченной операции, которая их несла.
    pub fn last_metadata(&self) -> Option<Vec<u8>> {
        self.checkpointer.last_metadata()
    }

    pub fn were_data_restored_after_open(&self) -> bool {
        self.restored_after_open
    }

    pub fn were_non_tx_operations_performed_in_previous_open(&self) -> bool {
        self.non_tx_in_previous_open
    }

    pub fn last_recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    pub fn wal(&self) -> &WriteAheadLog {
        &self.wal
    }

    pub fn atomic_manager(&self) -> &AtomicOperationsManager {
        &self.atomic
    }
}
