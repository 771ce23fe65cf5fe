//! atomic/table — таблица атомарных операций для удержания сегментов WAL.
//!
//! Запись: (op_id, сегмент старта, статус). Статусы:
//! - InProgress         — операция идёт; её сегмент старта нельзя отрезать;
//! - Committed(end_lsn) — AtomicUnitEnd записан, но страницы ещё не переданы в кэш;
//! - RolledBack / Persisted — терминальные, удаляются compact_table().
//!
//! Таблица не хранит содержимого записей.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::lsn::Lsn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    InProgress,
    Committed(Lsn),
    RolledBack,
    Persisted,
}

impl OperationStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::RolledBack | OperationStatus::Persisted)
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    segment: u64,
    status: OperationStatus,
}

#[derive(Debug, Default)]
pub struct AtomicOperationsTable {
    entries: Mutex<BTreeMap<u64, Entry>>,
}

impl AtomicOperationsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, op_id: u64, segment: u64) -> Result<()> {
        let mut m = self.entries.lock().unwrap();
        if m.contains_key(&op_id) {
            return Err(anyhow!("atomic operation {} is already registered", op_id));
        }
        m.insert(
            op_id,
            Entry {
                segment,
                status: OperationStatus::InProgress,
            },
        );
        Ok(())
    }

    fn transition(&self, op_id: u64, to: OperationStatus) -> Result<()> {
        let mut m = self.entries.lock().unwrap();
        let e = m
            .get_mut(&op_id)
            .ok_or_else(|| anyhow!("atomic operation {} is not registered", op_id))?;
        let ok = match (e.status, to) {
            (OperationStatus::InProgress, OperationStatus::Committed(_)) => true,
            (OperationStatus::InProgress, OperationStatus::RolledBack) => true,
            (OperationStatus::InProgress, OperationStatus::Persisted) => true,
            (OperationStatus::Committed(_), OperationStatus::Persisted) => true,
            _ => false,
        };
        if !ok {
            return Err(anyhow!(
                "atomic operation {}: illegal status change {:?} -> {:?}",
                op_id,
                e.status,
                to
            ));
        }
        e.status = to;
        Ok(())
    }

    pub fn commit(&self, op_id: u64, end_lsn: Lsn) -> Result<()> {
        self.transition(op_id, OperationStatus::Committed(end_lsn))
    }

    pub fn rollback(&self, op_id: u64) -> Result<()> {
        self.transition(op_id, OperationStatus::RolledBack)
    }

    /// Изменения операции переданы кэшу (дальше сегменты удерживает сам кэш).
    pub fn persist(&self, op_id: u64) -> Result<()> {
        self.transition(op_id, OperationStatus::Persisted)
    }

    pub fn remove(&self, op_id: u64) -> bool {
        self.entries.lock().unwrap().remove(&op_id).is_some()
    }

    pub fn status(&self, op_id: u64) -> Option<OperationStatus> {
        self.entries.lock().unwrap().get(&op_id).map(|e| e.status)
    }

    /// Удалить терминальные записи. Возвращает число удалённых.
    pub fn compact_table(&self) -> usize {
        let mut m = self.entries.lock().unwrap();
        let before = m.len();
        m.retain(|_, e| !e.status.is_terminal());
        before - m.len()
    }

    pub fn segment_earliest_operation_in_progress(&self) -> Option<u64> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.status == OperationStatus::InProgress)
            .map(|e| e.segment)
            .min()
    }

    pub fn segment_earliest_not_persisted_operation(&self) -> Option<u64> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| !e.status.is_terminal())
            .map(|e| e.segment)
            .min()
    }

    pub fn in_progress_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.status == OperationStatus::InProgress)
            .count()
    }

    /// Операции, чьи изменения ещё не переданы кэшу (идущие и закоммиченные).
    pub fn not_persisted_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| !e.status.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_segments_follow_statuses() -> Result<()> {
        let t = AtomicOperationsTable::new();
        t.register(1, 3)?;
        t.register(2, 5)?;
        t.register(3, 7)?;
        assert_eq!(t.segment_earliest_operation_in_progress(), Some(3));

        t.commit(1, Lsn::new(6, 16))?;
        // закоммичена, но не передана в кэш: удерживает сегмент 3
        assert_eq!(t.segment_earliest_operation_in_progress(), Some(5));
        assert_eq!(t.in_progress_count(), 2);
        assert_eq!(t.not_persisted_count(), 3);
        assert_eq!(t.segment_earliest_not_persisted_operation(), Some(3));

        t.persist(1)?;
        t.rollback(2)?;
        assert_eq!(t.segment_earliest_not_persisted_operation(), Some(7));
        assert_eq!(t.compact_table(), 2);
        assert_eq!(t.len(), 1);
        assert_eq!(t.in_progress_count(), 1);
        Ok(())
    }

    #[test]
    fn illegal_transitions_rejected() -> Result<()> {
        let t = AtomicOperationsTable::new();
        t.register(9, 1)?;
        assert!(t.register(9, 1).is_err());
        t.rollback(9)?;
        assert!(t.commit(9, Lsn::new(1, 16)).is_err());
        assert!(t.persist(42).is_err());
        assert!(t.remove(9));
        assert!(t.is_empty());
        Ok(())
    }
}
