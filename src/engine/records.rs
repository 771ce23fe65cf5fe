//! engine/records — одиночные операции над записями и чтение индексов.
//!
//! Изменения одной записи оформляются транзакцией из одной операции и проходят
//! обычный коммит; поверх берётся полоса из пула блокировок по hash(rid), чтобы
//! чтение-проверка-запись одной записи не перемешивались.

use anyhow::Result;

use super::StorageEngine;
use crate::error::{StorageError, StorageResult};
use crate::storage::{PhysicalPosition, RawRecord, Rid, Transaction};

impl StorageEngine {
    /// Новая запись; возвращает её RID и начальную версию.
    pub fn create_record(
        &self,
        cluster_id: i32,
        content: &[u8],
        version: i32,
        record_type: u8,
    ) -> StorageResult<(Rid, i32)> {
        self.guard("create_record", || {
            let mut tx = Transaction::new(0);
            tx.create_versioned(cluster_id, content.to_vec(), version, record_type);
            let ops = self.commit_tx(tx, false)?;
            let rec = &ops[0].record;
            Ok((rec.rid, rec.version))
        })
    }

    pub fn read_record(&self, rid: Rid) -> StorageResult<RawRecord> {
        self.guard("read_record", || {
            let _r = self.record_locks.lock(rid);
            let _state = self.state.read();
            let comps = self.read_components()?;
            comps
                .cluster(rid.cluster_id)?
                .read_record(&self.reader(), rid.position)?
                .ok_or_else(|| StorageError::RecordNotFound(rid).into())
        })
    }

    /// Обновить содержимое; возвращает новую версию.
    pub fn update_record(
        &self,
        rid: Rid,
        content: &[u8],
        version: i32,
        record_type: u8,
    ) -> StorageResult<i32> {
        self.guard("update_record", || {
            let _r = self.record_locks.lock(rid);
            let mut tx = Transaction::new(0);
            tx.update(rid, content.to_vec(), version, record_type);
            let ops = self.commit_tx(tx, false)?;
            Ok(ops[0].record.version)
        })
    }

    /// Удалить запись. Отсутствующая запись — RecordNotFound.
    pub fn delete_record(&self, rid: Rid, version: i32) -> StorageResult<()> {
        self.guard("delete_record", || {
            let _r = self.record_locks.lock(rid);
            let mut tx = Transaction::new(0);
            tx.delete(rid, version);
            self.commit_tx(tx, false).map(|_| ())
        })
    }

    pub fn record_exists(&self, rid: Rid) -> StorageResult<bool> {
        self.guard("record_exists", || {
            let _state = self.state.read();
            let comps = self.read_components()?;
            match comps.clusters.get(&rid.cluster_id) {
                Some(c) if rid.position >= 0 => c.exists(&self.reader(), rid.position),
                _ => Ok(false),
            }
        })
    }

    /// Версия, тип и размер записи без чтения содержимого.
    pub fn get_record_metadata(&self, rid: Rid) -> StorageResult<Option<PhysicalPosition>> {
        self.guard("get_record_metadata", || {
            let _state = self.state.read();
            let comps = self.read_components()?;
            if rid.position < 0 {
                return Ok(None);
            }
            comps
                .cluster(rid.cluster_id)?
                .get_physical_position(&self.reader(), rid.position)
        })
    }

    /// Число живых записей кластера.
    pub fn count_records(&self, cluster_id: i32) -> StorageResult<u64> {
        self.guard("count_records", || {
            let _state = self.state.read();
            let comps = self.read_components()?;
            comps.cluster(cluster_id)?.entries(&self.reader())
        })
    }

    /// Позиции живых записей кластера по возрастанию.
    pub fn record_positions(&self, cluster_id: i32) -> StorageResult<Vec<i64>> {
        self.guard("record_positions", || {
            let _state = self.state.read();
            let comps = self.read_components()?;
            comps.cluster(cluster_id)?.positions(&self.reader())
        })
    }

    pub fn index_get(&self, index: &str, key: &[u8]) -> StorageResult<Vec<Rid>> {
        self.guard("index_get", || {
            let _state = self.state.read();
            let comps = self.read_components()?;
            comps.index(index)?.get(&self.reader(), key)
        })
    }

    pub fn index_size(&self, index: &str) -> StorageResult<u64> {
        self.guard("index_size", || -> Result<u64> {
            let _state = self.state.read();
            let comps = self.read_components()?;
            comps.index(index)?.size(&self.reader())
        })
    }
}
