//! engine/open — жизненный цикл: create/open, close, delete, crash.
//!
//! Открытие:
//! 1) LOCK (exclusive), meta;
//! 2) WAL, кэш страниц, менеджер атомарных операций;
//! 3) если meta.dirty — redo из WAL (под migration-локом), затем полный чекпоинт
//!    (журнал отрезается целиком, включая битый хвост);
//! 4) реестр компонентов, проверка заголовков кластеров и индексов;
//! 5) WAL vacuum и listener журнала.
//!
//! Закрытие: стоп vacuum, полный чекпоинт (если нет липкой ошибки), close WAL и кэша.

use anyhow::Result;
use log::{info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use super::{Components, StorageEngine};
use crate::atomic::AtomicOperationsManager;
use crate::cache::{CacheReader, FilePageCache, PageCache};
use crate::checkpoint::{Checkpointer, WalVacuum};
use crate::config::StrataConfig;
use crate::error::{ErrorState, StorageError, StorageResult};
use crate::lock::{try_lock_dir, LockMode};
use crate::meta::{
    meta_exists, read_meta, set_non_tx_operations, validate_page_size, write_meta_new, DirtyFlag,
    StartupMeta,
};
use crate::metrics::StorageMetrics;
use crate::recovery::restore_from_wal;
use crate::storage::{HashIndex, IndexEngine, PagedCluster, StateLock, StorageRegistry, StripedLocks};
use crate::wal::{wal_dir, WriteAheadLog};

impl StorageEngine {
    /// Создать новое хранилище в `root` (каталог может не существовать).
    pub fn create(root: &Path, cfg: StrataConfig) -> StorageResult<Self> {
        Self::open_inner(root, cfg, true).map_err(|e| log_open_error("create", e))
    }

    /// Открыть существующее хранилище; после нечистого завершения восстанавливает его.
    pub fn open(root: &Path, cfg: StrataConfig) -> StorageResult<Self> {
        Self::open_inner(root, cfg, false).map_err(|e| log_open_error("open", e))
    }

    fn open_inner(root: &Path, cfg: StrataConfig, create: bool) -> Result<Self> {
        if create {
            validate_page_size(cfg.page_size)
                .map_err(|e| StorageError::IllegalArgument(format!("{:#}", e)))?;
            fs::create_dir_all(root)?;
            if meta_exists(root) {
                return Err(StorageError::IllegalArgument(format!(
                    "storage already exists at {}",
                    root.display()
                ))
                .into());
            }
        } else if !meta_exists(root) {
            return Err(StorageError::IllegalArgument(format!(
                "no storage at {}",
                root.display()
            ))
            .into());
        }

        let lock = try_lock_dir(root, LockMode::Exclusive)?;
        if create {
            let m = StartupMeta::new(cfg.page_size);
            write_meta_new(root, &m)?;
            StorageRegistry::new(m.instance_id_hex()).save(root)?;
            info!("create: storage {} ({})", root.display(), m.instance_id_hex());
        }
        let meta = read_meta(root)?;

        let metrics = Arc::new(StorageMetrics::new());
        let wal = Arc::new(WriteAheadLog::open(
            &wal_dir(root),
            cfg.wal_segment_size,
            cfg.wal_fsync,
            metrics.clone(),
        )?);
        let cache = Arc::new(FilePageCache::open(
            root,
            meta.page_size as usize,
            cfg.data_fsync,
            cfg.read_cache_pages,
            wal.clone(),
        )?);
        let cache_dyn: Arc<dyn PageCache> = cache.clone();
        let dirty = Arc::new(DirtyFlag::new(root, meta.dirty));
        let atomic = Arc::new(AtomicOperationsManager::new(
            wal.clone(),
            cache_dyn.clone(),
            dirty.clone(),
            cfg.wal_sync_on_commit,
            metrics.clone(),
        ));
        let state = Arc::new(StateLock::new());
        let errors = Arc::new(ErrorState::new());
        let checkpointer = Arc::new(Checkpointer::new(
            wal.clone(),
            cache_dyn.clone(),
            atomic.clone(),
            state.clone(),
            dirty,
            errors.clone(),
            metrics.clone(),
            Duration::from_millis(cfg.state_lock_poll_ms),
            cfg.vacuum_max_rounds,
        ));
        checkpointer.set_last_metadata(cache.last_synced_metadata());

        let migration_lock = state.clone();
        let _migration = migration_lock.start_migration();

        let mut recovery = None;
        let mut restored = false;
        let mut non_tx_prev = meta.non_tx_operations;
        if meta.dirty {
            warn!(
                "open: storage {} was not closed properly, restoring from WAL",
                root.display()
            );
            let report = restore_from_wal(
                &wal,
                &*cache_dyn,
                cfg.wal_read_batch,
                cfg.restore_report_interval,
            )?;
            metrics.record_recovery(
                report.records_read,
                report.units_applied,
                report.units_discarded,
            );
            atomic.advance_op_id(report.max_op_id);
            checkpointer.set_last_metadata(report.last_metadata.clone());
            non_tx_prev |= report.non_tx_operations;
            restored = report.applied_anything();
            recovery = Some(report);
        }
        if meta.non_tx_operations {
            set_non_tx_operations(root, false)?;
        }
        // После любого прохода журнал отрезается по свежий маркер: битая страница
        // или отброшенные хвосты не должны оказаться перед новыми записями.
        if let Some(report) = &recovery {
            checkpointer.flush_all_data()?;
            if let Some(at) = report.broken_at {
                warn!(
                    "open: WAL of storage {} was broken at {}, records past it are dropped",
                    root.display(),
                    at
                );
            }
            if restored {
                info!("open: storage {} restored", root.display());
            }
        }

        let components = load_components(root, &*cache_dyn)?;

        let vacuum = WalVacuum::start(checkpointer.clone())?;
        let handle = vacuum.handle();
        wal.set_checkpoint_listener(Some(Arc::new(move || handle.request())));

        let record_locks = StripedLocks::new(cfg.record_lock_stripes);
        info!(
            "open: storage {} page_size={} clusters={} indexes={}",
            root.display(),
            meta.page_size,
            components.clusters.len(),
            components.indexes.len()
        );
        Ok(Self {
            root: root.to_path_buf(),
            cfg,
            meta,
            wal,
            cache,
            atomic,
            state,
            record_locks,
            components: RwLock::new(components),
            checkpointer,
            vacuum: Mutex::new(Some(vacuum)),
            errors,
            metrics,
            freeze_tokens: Mutex::new(Vec::new()),
            broken_pages: Mutex::new(Vec::new()),
            recovery,
            restored_after_open: restored,
            non_tx_in_previous_open: non_tx_prev,
            closed: AtomicBool::new(false),
            _lock: lock,
        })
    }

    fn stop_vacuum(&self) {
        self.wal.set_checkpoint_listener(None);
        if let Some(mut v) = self.vacuum.lock().unwrap().take() {
            v.stop();
        }
    }

    /// Чистое закрытие: полный чекпоинт, после которого открытие не требует
    /// восстановления. Повторный вызов ничего не делает.
    pub fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _state = self.state.write();
        self.stop_vacuum();
        let res = (|| -> Result<()> {
            if self.errors.is_set() {
                warn!(
                    "close: storage {} is in error state, checkpoint skipped",
                    self.root.display()
                );
            } else {
                self.checkpointer.flush_all_data()?;
            }
            self.wal.close()?;
            self.cache.close()?;
            Ok(())
        })();
        match res {
            Ok(()) => {
                info!("close: storage {} closed", self.root.display());
                Ok(())
            }
            Err(e) => Err(self.errors.handle("close", e)),
        }
    }

    /// Закрыть и удалить все файлы хранилища вместе с каталогом.
    pub fn delete(self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        let root = self.root.clone();
        let res = (|| -> Result<()> {
            let _state = self.state.write();
            self.stop_vacuum();
            self.wal.delete()?;
            self.cache.delete()?;
            Ok(())
        })();
        drop(self);
        res.map_err(StorageError::classify)?;
        fs::remove_dir_all(&root)
            .map_err(|e| StorageError::Io(format!("remove {}: {}", root.display(), e)))?;
        info!("delete: storage {} removed", root.display());
        Ok(())
    }

    /// Бросить хранилище без чекпоинта (имитация падения процесса): грязные
    /// страницы теряются, журнал и dirty-флаг остаются как есть.
    pub fn crash(self) {
        self.closed.store(true, Ordering::Release);
        self.stop_vacuum();
        warn!("crash: storage {} dropped without checkpoint", self.root.display());
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.close() {
            warn!("drop: close of {} failed: {}", self.root.display(), e);
        }
    }
}

fn log_open_error(op_name: &str, e: anyhow::Error) -> StorageError {
    let se = StorageError::classify(e);
    warn!("{}: [{:016x}] {}", op_name, se.correlation_id(), se);
    se
}

fn load_components(root: &Path, cache: &dyn PageCache) -> Result<Components> {
    let registry = StorageRegistry::load(root)?;
    let src = CacheReader(cache);
    let mut clusters = BTreeMap::new();
    for def in &registry.clusters {
        let c = PagedCluster::open(def.id, &def.name, def.map_file, def.data_file);
        c.verify(&src)?;
        clusters.insert(def.id, c);
    }
    let mut indexes: BTreeMap<String, Arc<dyn IndexEngine>> = BTreeMap::new();
    for def in &registry.indexes {
        let idx = HashIndex::open(&src, &def.name, def.file_id)?;
        indexes.insert(def.name.clone(), Arc::new(idx));
    }
    Ok(Components {
        registry,
        clusters,
        indexes,
    })
}
