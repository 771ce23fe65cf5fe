//! engine/commit — коммит клиентской транзакции как одной атомарной операции.
//!
//! Порядок внутри операции:
//! 1) кластеры всех записей блокируются по возрастанию id;
//! 2) новым записям выделяются позиции (временные RID заменяются настоящими);
//!    запись с заранее заданной позицией добивает плейсхолдерами до неё, иначе
//!    ConcurrentCreate;
//! 3) операции применяются в порядке транзакции с MVCC-проверкой версий;
//! 4) изменения индексов: индексы по возрастанию имени, каждый под своим локом,
//!    ключи по порядку, изменения ключа в порядке записи;
//! 5) конец операции (коммит либо откат при любой ошибке).
//!
//! Порядок захвата (кластеры, затем индексы, всё отсортировано) одинаков для всех
//! коммитов, поэтому перекрывающиеся транзакции сериализуются без взаимоблокировок.

use anyhow::Result;
use log::{debug, warn};
use std::collections::{BTreeSet, HashMap};

use super::{Components, StorageEngine};
use crate::atomic::{AtomicOperation, OperationContext};
use crate::error::{StorageError, StorageResult};
use crate::storage::version::{check_and_increment, check_delete, initial_version};
use crate::storage::{
    IndexKeyOp, PhysicalPosition, RecordOperation, RecordOperationKind, Rid, Transaction,
};

impl StorageEngine {
    /// Закоммитить транзакцию; возвращает её операции с итоговыми RID и версиями.
    pub fn commit(&self, tx: Transaction) -> StorageResult<Vec<RecordOperation>> {
        self.guard("commit", || self.commit_tx(tx, false))
    }

    /// Коммит транзакции, чьим новым записям позиции уже выделены preallocate_rids().
    pub fn commit_pre_allocated(&self, tx: Transaction) -> StorageResult<Vec<RecordOperation>> {
        self.guard("commit_pre_allocated", || self.commit_tx(tx, true))
    }

    /// Транзакция без изменений, несущая только метаданные.
    pub fn commit_metadata(&self, metadata: Vec<u8>) -> StorageResult<()> {
        let mut tx = Transaction::new(0);
        tx.set_metadata(Some(metadata));
        self.guard("commit_metadata", || self.commit_tx(tx, false).map(|_| ()))
    }

    /// Выделить позиции всем новым записям транзакции отдельной атомарной операцией.
    /// Позиции остаются в статусе «выделена», пока commit_pre_allocated их не заполнит.
    pub fn preallocate_rids(&self, tx: &mut Transaction) -> StorageResult<()> {
        self.guard("preallocate_rids", || {
            let _state = self.state.read();
            let comps = self.read_components()?;
            let targets: Vec<(Rid, u8)> = tx
                .operations()
                .iter()
                .filter(|o| o.kind == RecordOperationKind::Created && o.record.rid.is_temporary())
                .map(|o| (o.record.rid, o.record.record_type))
                .collect();
            if targets.is_empty() {
                return Ok(());
            }
            let cluster_ids: BTreeSet<i32> = targets.iter().map(|(r, _)| r.cluster_id).collect();

            let mut ctx = OperationContext::new();
            let map = self.atomic.calculate_inside_atomic_operation(&mut ctx, None, |op| {
                for cid in &cluster_ids {
                    let key = comps.cluster(*cid)?.lock_key();
                    self.atomic
                        .acquire_exclusive_lock_till_operation_complete(op, &key);
                }
                let mut map = HashMap::with_capacity(targets.len());
                for (rid, record_type) in &targets {
                    let pp = comps.cluster(rid.cluster_id)?.allocate_position(op, *record_type)?;
                    map.insert(*rid, Rid::new(rid.cluster_id, pp.cluster_position));
                }
                Ok(map)
            })?;
            debug!("preallocate_rids: tx={} allocated {}", tx.id(), map.len());
            tx.remap_rids(&map);
            Ok(())
        })
    }

    pub(super) fn commit_tx(&self, mut tx: Transaction, pre_allocated: bool) -> Result<Vec<RecordOperation>> {
        let _state = self.state.read();
        let comps = self.read_components()?;

        // неизвестный кластер или индекс отсекается до старта операции
        let cluster_ids: BTreeSet<i32> =
            tx.operations().iter().map(|o| o.record.rid.cluster_id).collect();
        for cid in &cluster_ids {
            comps.cluster(*cid)?;
        }
        for name in tx.index_changes().keys() {
            comps.index(name)?;
        }

        let mut ctx = OperationContext::new();
        let mut op = self
            .atomic
            .start_atomic_operation(&mut ctx, tx.metadata().map(|m| m.to_vec()))?;
        match self.apply_tx(&mut op, &comps, &cluster_ids, &mut tx, pre_allocated) {
            Ok(()) => {
                self.atomic.end_atomic_operation(&mut ctx, op, None)?;
                if let Some(m) = tx.metadata() {
                    self.checkpointer.set_last_metadata(Some(m.to_vec()));
                }
                self.metrics.record_tx_commit();
                debug!("commit: tx={} ops={}", tx.id(), tx.operations().len());
                Ok(tx.into_operations())
            }
            Err(e) => {
                if StorageError::find(&e).map_or(false, |se| se.is_conflict()) {
                    self.metrics.record_tx_conflict();
                }
                if let Err(end_err) = self.atomic.end_atomic_operation(&mut ctx, op, Some(&e)) {
                    warn!("commit: rollback of tx={} failed: {:#}", tx.id(), end_err);
                }
                Err(e)
            }
        }
    }

    fn apply_tx(
        &self,
        op: &mut AtomicOperation,
        comps: &Components,
        cluster_ids: &BTreeSet<i32>,
        tx: &mut Transaction,
        pre_allocated: bool,
    ) -> Result<()> {
        for cid in cluster_ids {
            let key = comps.cluster(*cid)?.lock_key();
            self.atomic.acquire_exclusive_lock_till_operation_complete(op, &key);
        }

        // размещение новых записей
        let mut allocated: HashMap<usize, PhysicalPosition> = HashMap::new();
        let mut rid_map: HashMap<Rid, Rid> = HashMap::new();
        for (i, rop) in tx.operations().iter().enumerate() {
            if rop.kind != RecordOperationKind::Created {
                continue;
            }
            let rid = rop.record.rid;
            let cluster = comps.cluster(rid.cluster_id)?;
            if pre_allocated {
                if !rid.is_persistent() {
                    return Err(StorageError::Storage(format!(
                        "record {} has no pre-allocated position",
                        rid
                    ))
                    .into());
                }
                allocated.insert(
                    i,
                    PhysicalPosition {
                        cluster_position: rid.position,
                        record_version: 0,
                        record_type: rop.record.record_type,
                        record_size: 0,
                    },
                );
            } else if rid.is_persistent() {
                let mut pp = cluster.allocate_position(op, rop.record.record_type)?;
                while pp.cluster_position < rid.position {
                    pp = cluster.allocate_position(op, rop.record.record_type)?;
                }
                if pp.cluster_position != rid.position {
                    return Err(StorageError::ConcurrentCreate {
                        expected: rid,
                        actual: Rid::new(rid.cluster_id, pp.cluster_position),
                    }
                    .into());
                }
                allocated.insert(i, pp);
            } else {
                let pp = cluster.allocate_position(op, rop.record.record_type)?;
                rid_map.insert(rid, Rid::new(rid.cluster_id, pp.cluster_position));
                allocated.insert(i, pp);
            }
        }
        tx.remap_rids(&rid_map);

        for (i, rop) in tx.operations_mut().iter_mut().enumerate() {
            let rid = rop.record.rid;
            let cluster = comps.cluster(rid.cluster_id)?;
            match rop.kind {
                RecordOperationKind::Created => {
                    let version = initial_version(rop.record.version);
                    cluster.create_record(
                        op,
                        &rop.record.content,
                        version,
                        rop.record.record_type,
                        allocated.get(&i),
                    )?;
                    rop.record.version = version;
                }
                RecordOperationKind::Updated => {
                    let pp = cluster
                        .get_physical_position(&*op, rid.position)?
                        .ok_or(StorageError::RecordNotFound(rid))?;
                    let version = check_and_increment(rid, pp.record_version, rop.record.version)?;
                    if rop.record.content_changed {
                        cluster.update_record(
                            op,
                            rid.position,
                            &rop.record.content,
                            version,
                            rop.record.record_type,
                        )?;
                    } else if version != pp.record_version {
                        cluster.update_record_version(op, rid.position, version)?;
                    }
                    rop.record.version = version;
                }
                RecordOperationKind::Deleted => {
                    let pp = cluster
                        .get_physical_position(&*op, rid.position)?
                        .ok_or(StorageError::RecordNotFound(rid))?;
                    check_delete(rid, pp.record_version, rop.record.version)?;
                    cluster.delete_record(op, rid.position)?;
                    rop.record.version = pp.record_version;
                }
            }
        }

        for (name, changes) in tx.index_changes() {
            let index = comps.index(name)?;
            self.atomic
                .acquire_exclusive_lock_till_operation_complete(op, &index.lock_key());
            if changes.cleared {
                index.clear(op)?;
            }
            for (key, ops) in &changes.keys {
                for o in ops {
                    match o {
                        IndexKeyOp::Put(rid) => {
                            if rid.is_temporary() {
                                return Err(StorageError::IllegalArgument(format!(
                                    "index '{}': value {} is not a record of this transaction",
                                    name, rid
                                ))
                                .into());
                            }
                            index.put(op, key, *rid)?;
                        }
                        IndexKeyOp::Remove(rid) => {
                            index.remove(op, key, *rid)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
