//! atomic/manager — AtomicOperationsManager: старт/коммит/откат атомарных операций.
//!
//! Текущая операция живёт в явном OperationContext, который вызывающий передаёт
//! в каждый вызов; второй start на том же контексте — NestedAtomicOperation.
//!
//! Коммит (порядок важен для восстановления):
//! 1) AtomicUnitStart{op_id, metadata}
//! 2) FileCreated / FileDeleted
//! 3) UpdatePage на каждую изменённую или добавленную страницу (diff тела + initial_lsn)
//! 4) AtomicUnitEnd{op_id, metadata}; при wal_sync_on_commit — flush WAL
//! 5) table.commit(end_lsn); страницы передаются кэшу со своими LSN
//! 6) table.persist; компонентные локи отпускаются
//!
//! Откат ничего не пишет в WAL.

use anyhow::{anyhow, Result};
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::freeze::FreezeGate;
use super::locks::ComponentLocks;
use super::operation::AtomicOperation;
use super::table::AtomicOperationsTable;
use crate::cache::PageCache;
use crate::error::StorageError;
use crate::lsn::Lsn;
use crate::meta::DirtyFlag;
use crate::metrics::StorageMetrics;
use crate::page::{Page, PageChanges};
use crate::wal::{WalRecord, WriteAheadLog};

/// Контекст исполнения: не более одной текущей атомарной операции.
#[derive(Debug, Default)]
pub struct OperationContext {
    current: Option<u64>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<u64> {
        self.current
    }
}

pub struct AtomicOperationsManager {
    wal: Arc<WriteAheadLog>,
    cache: Arc<dyn PageCache>,
    table: AtomicOperationsTable,
    locks: ComponentLocks,
    freeze: FreezeGate,
    dirty: Arc<DirtyFlag>,
    next_op_id: AtomicU64,
    sync_on_commit: bool,
    metrics: Arc<StorageMetrics>,
}

impl AtomicOperationsManager {
    pub fn new(
        wal: Arc<WriteAheadLog>,
        cache: Arc<dyn PageCache>,
        dirty: Arc<DirtyFlag>,
        sync_on_commit: bool,
        metrics: Arc<StorageMetrics>,
    ) -> Self {
        Self {
            wal,
            cache,
            table: AtomicOperationsTable::new(),
            locks: ComponentLocks::new(),
            freeze: FreezeGate::new(),
            dirty,
            next_op_id: AtomicU64::new(1),
            sync_on_commit,
            metrics,
        }
    }

    pub fn table(&self) -> &AtomicOperationsTable {
        &self.table
    }

    pub fn locks(&self) -> &ComponentLocks {
        &self.locks
    }

    /// Id операций после восстановления не должны пересекаться с id в журнале.
    pub fn advance_op_id(&self, past: u64) {
        self.next_op_id.fetch_max(past + 1, Ordering::SeqCst);
    }

    pub fn start_atomic_operation(
        &self,
        ctx: &mut OperationContext,
        metadata: Option<Vec<u8>>,
    ) -> Result<AtomicOperation> {
        if ctx.current.is_some() {
            return Err(StorageError::NestedAtomicOperation.into());
        }
        self.freeze.enter()?;
        if let Err(e) = self.dirty.make_dirty() {
            self.freeze.leave();
            return Err(e);
        }

        let op_id = self.next_op_id.fetch_add(1, Ordering::SeqCst);
        let start = self.wal.next_lsn();
        if let Err(e) = self.table.register(op_id, start.segment) {
            self.freeze.leave();
            return Err(e);
        }
        ctx.current = Some(op_id);
        debug!("start_atomic_operation: op={} segment={}", op_id, start.segment);
        Ok(AtomicOperation::new(op_id, start, metadata, self.cache.clone()))
    }

    /// Завершить операцию: `error == None` — коммит, иначе откат.
    /// Возвращает LSN записи AtomicUnitEnd (None при откате или пустой операции).
    pub fn end_atomic_operation(
        &self,
        ctx: &mut OperationContext,
        op: AtomicOperation,
        error: Option<&anyhow::Error>,
    ) -> Result<Option<Lsn>> {
        if ctx.current != Some(op.op_id()) {
            return Err(StorageError::InvalidState(format!(
                "atomic operation {} is not current for this context ({:?})",
                op.op_id(),
                ctx.current
            ))
            .into());
        }
        ctx.current = None;

        let res = match error {
            Some(e) => {
                debug!("end_atomic_operation: op={} rolled back: {:#}", op.op_id(), e);
                self.table.rollback(op.op_id()).map(|_| None)
            }
            None => self.commit_changes(&op),
        };
        if error.is_some() || res.is_err() {
            self.metrics.record_atomic_rollback();
        } else {
            self.metrics.record_atomic_commit();
        }

        self.locks.release_all(op.op_id(), op.locked_objects());
        self.freeze.leave();
        res
    }

    fn commit_changes(&self, op: &AtomicOperation) -> Result<Option<Lsn>> {
        let op_id = op.op_id();
        if !op.has_changes() && op.metadata().is_none() {
            self.table.persist(op_id)?;
            return Ok(None);
        }

        let mut page_lsns: Vec<((u64, u64), Lsn)> = Vec::with_capacity(op.pages.len());
        let mut start_lsn = Lsn::ZERO;
        let logged = (|| -> Result<Lsn> {
            start_lsn = self.wal.log(&WalRecord::AtomicUnitStart {
                op_id,
                metadata: op.metadata().map(|m| m.to_vec()),
            })?;
            for (file_id, name) in &op.files_to_create {
                self.wal.log(&WalRecord::FileCreated {
                    op_id,
                    file_id: *file_id,
                    name: name.clone(),
                })?;
            }
            for file_id in &op.files_to_delete {
                self.wal.log(&WalRecord::FileDeleted {
                    op_id,
                    file_id: *file_id,
                })?;
            }
            for (key, b) in &op.pages {
                let after = b.current.as_bytes();
                let (from, to) = b.current.body_range();
                let changes = match &b.original {
                    Some(before) => PageChanges::diff(before, after, from, to)?,
                    None => {
                        let blank = Page::new(key.0, key.1, after.len());
                        PageChanges::diff(blank.as_bytes(), after, from, to)?
                    }
                };
                // неизменённая существующая страница в журнал не попадает
                if changes.is_empty() && b.original.is_some() {
                    continue;
                }
                let lsn = self.wal.log(&WalRecord::UpdatePage {
                    op_id,
                    file_id: key.0,
                    page_index: key.1,
                    initial_lsn: b.initial_lsn,
                    changes,
                })?;
                page_lsns.push((*key, lsn));
            }
            let end = self.wal.log(&WalRecord::AtomicUnitEnd {
                op_id,
                metadata: op.metadata().map(|m| m.to_vec()),
            })?;
            if self.sync_on_commit {
                self.wal.flush()?;
            }
            Ok(end)
        })();

        let end_lsn = match logged {
            Ok(l) => l,
            Err(e) => {
                if let Err(re) = self.table.rollback(op_id) {
                    warn!("end_atomic_operation: op={} table rollback: {:#}", op_id, re);
                }
                return Err(e);
            }
        };
        self.table.commit(op_id, end_lsn)?;

        self.apply_to_cache(op, start_lsn, &page_lsns)?;
        self.table.persist(op_id)?;
        debug!(
            "end_atomic_operation: op={} committed at {} ({} page record(s))",
            op_id,
            end_lsn,
            page_lsns.len()
        );
        Ok(Some(end_lsn))
    }

    fn apply_to_cache(
        &self,
        op: &AtomicOperation,
        start_lsn: Lsn,
        page_lsns: &[((u64, u64), Lsn)],
    ) -> Result<()> {
        for (file_id, name) in &op.files_to_create {
            self.cache.add_file_with_id(name, *file_id)?;
        }
        for (key, lsn) in page_lsns {
            let b = op
                .pages
                .get(key)
                .ok_or_else(|| anyhow!("page {}:{} missing from operation buffer", key.0, key.1))?;
            let mut page = if b.original.is_none() {
                let p = self.cache.allocate_new_page(key.0)?;
                if p.index() != key.1 {
                    return Err(StorageError::InvalidState(format!(
                        "op {}: file {} grew concurrently (expected page {}, cache gave {})",
                        op.op_id(),
                        key.0,
                        key.1,
                        p.index()
                    ))
                    .into());
                }
                p
            } else {
                self.cache.load_for_write(key.0, key.1)?
            };
            page.as_bytes_mut().copy_from_slice(b.current.as_bytes());
            page.set_lsn(*lsn);
            self.cache.release_from_write(page, start_lsn)?;
        }
        for file_id in &op.files_to_delete {
            self.cache.delete_file(*file_id)?;
        }
        Ok(())
    }

    pub fn execute_inside_atomic_operation<F>(
        &self,
        ctx: &mut OperationContext,
        metadata: Option<Vec<u8>>,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut AtomicOperation) -> Result<()>,
    {
        self.calculate_inside_atomic_operation(ctx, metadata, body)
    }

    pub fn calculate_inside_atomic_operation<T, F>(
        &self,
        ctx: &mut OperationContext,
        metadata: Option<Vec<u8>>,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut AtomicOperation) -> Result<T>,
    {
        let mut op = self.start_atomic_operation(ctx, metadata)?;
        match body(&mut op) {
            Ok(v) => {
                self.end_atomic_operation(ctx, op, None)?;
                Ok(v)
            }
            Err(e) => {
                if let Err(end_err) = self.end_atomic_operation(ctx, op, Some(&e)) {
                    warn!("calculate_inside_atomic_operation: rollback failed: {:#}", end_err);
                }
                Err(e)
            }
        }
    }

    /// Эксклюзивная блокировка компонента до конца операции (повторный вызов — no-op).
    pub fn acquire_exclusive_lock_till_operation_complete(&self, op: &mut AtomicOperation, key: &str) {
        if op.locked.contains(key) {
            return;
        }
        self.locks.acquire(key, op.op_id());
        op.locked.insert(key.to_string());
    }

    pub fn freeze_atomic_operations(&self, error: Option<String>) -> u64 {
        let token = self.freeze.freeze(error);
        debug!("freeze_atomic_operations: token={}", token);
        token
    }

    /// Закрыть вход новым операциям без ожидания идущих; снимается
    /// release_atomic_operations.
    pub fn hold_atomic_operations(&self) -> u64 {
        let token = self.freeze.hold(None);
        debug!("hold_atomic_operations: token={}", token);
        token
    }

    pub fn release_atomic_operations(&self, token: u64) -> Result<()> {
        self.freeze.release(token)?;
        debug!("release_atomic_operations: token={}", token);
        Ok(())
    }

    pub fn active_operations(&self) -> usize {
        self.freeze.active()
    }

    /// Отметить в журнале изменение в обход атомарных операций.
    pub fn log_non_tx_operation(&self) -> Result<Lsn> {
        self.wal.log(&WalRecord::NonTxOperationPerformed)
    }
}
