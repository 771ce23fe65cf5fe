//! Клиентская транзакция: упорядоченные операции над записями + изменения индексов.
//!
//! Транзакция копится в памяти у вызывающего и целиком отдаётся в
//! StorageEngine::commit(); движок превращает её в одну атомарную операцию.

use std::collections::{BTreeMap, HashMap};

use super::Rid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOperationKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub rid: Rid,
    pub content: Vec<u8>,
    pub version: i32,
    pub record_type: u8,
    /// false — содержимое не менялось, двигается только версия.
    pub content_changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOperation {
    pub kind: RecordOperationKind,
    pub record: Record,
}

/// Логическое изменение ключа индекса.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKeyOp {
    Put(Rid),
    /// None — удалить все значения ключа.
    Remove(Option<Rid>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexChanges {
    /// Индекс очищается до применения поключевых изменений.
    pub cleared: bool,
    pub keys: BTreeMap<Vec<u8>, Vec<IndexKeyOp>>,
}

#[derive(Debug, Clone, Default)]
pub struct Transaction {
    id: u64,
    operations: Vec<RecordOperation>,
    index_changes: BTreeMap<String, IndexChanges>,
    metadata: Option<Vec<u8>>,
    next_temp: i64,
}

impl Transaction {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            next_temp: -2,
            ..Default::default()
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn operations(&self) -> &[RecordOperation] {
        &self.operations
    }

    pub fn index_changes(&self) -> &BTreeMap<String, IndexChanges> {
        &self.index_changes
    }

    pub fn metadata(&self) -> Option<&[u8]> {
        self.metadata.as_deref()
    }

    pub fn set_metadata(&mut self, metadata: Option<Vec<u8>>) {
        self.metadata = metadata;
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.index_changes.is_empty()
    }

    /// Новая запись в кластере; возвращает временный RID.
    pub fn create(&mut self, cluster_id: i32, content: Vec<u8>, record_type: u8) -> Rid {
        self.create_versioned(cluster_id, content, -1, record_type)
    }

    /// То же с явно заданной версией (> -1 — версия станет version+1).
    pub fn create_versioned(
        &mut self,
        cluster_id: i32,
        content: Vec<u8>,
        version: i32,
        record_type: u8,
    ) -> Rid {
        let rid = Rid::new(cluster_id, self.next_temp);
        self.next_temp -= 1;
        self.push(RecordOperationKind::Created, rid, content, version, record_type, true);
        rid
    }

    /// Новая запись с заранее заданной позицией (путь репликации / починки)
    /// или с уже выделенной позицией (commit_pre_allocated).
    pub fn create_at(&mut self, rid: Rid, content: Vec<u8>, version: i32, record_type: u8) {
        self.push(RecordOperationKind::Created, rid, content, version, record_type, true);
    }

    pub fn update(&mut self, rid: Rid, content: Vec<u8>, version: i32, record_type: u8) {
        self.push(RecordOperationKind::Updated, rid, content, version, record_type, true);
    }

    /// Продвинуть/проверить версию без перезаписи содержимого.
    pub fn touch(&mut self, rid: Rid, version: i32, record_type: u8) {
        self.push(
            RecordOperationKind::Updated,
            rid,
            Vec::new(),
            version,
            record_type,
            false,
        );
    }

    pub fn delete(&mut self, rid: Rid, version: i32) {
        self.push(RecordOperationKind::Deleted, rid, Vec::new(), version, 0, false);
    }

    fn push(
        &mut self,
        kind: RecordOperationKind,
        rid: Rid,
        content: Vec<u8>,
        version: i32,
        record_type: u8,
        content_changed: bool,
    ) {
        self.operations.push(RecordOperation {
            kind,
            record: Record {
                rid,
                content,
                version,
                record_type,
                content_changed,
            },
        });
    }

    pub fn index_put(&mut self, index: &str, key: &[u8], rid: Rid) {
        self.key_ops(index, key).push(IndexKeyOp::Put(rid));
    }

    pub fn index_remove(&mut self, index: &str, key: &[u8], rid: Option<Rid>) {
        self.key_ops(index, key).push(IndexKeyOp::Remove(rid));
    }

    /// CLEAR отменяет накопленные ранее в этой транзакции изменения индекса.
    pub fn index_clear(&mut self, index: &str) {
        let ch = self.index_changes.entry(index.to_string()).or_default();
        ch.cleared = true;
        ch.keys.clear();
    }

    fn key_ops(&mut self, index: &str, key: &[u8]) -> &mut Vec<IndexKeyOp> {
        self.index_changes
            .entry(index.to_string())
            .or_default()
            .keys
            .entry(key.to_vec())
            .or_default()
    }

    /// Заменить временные RID'ы выделенными (после размещения новых записей).
    pub(crate) fn remap_rids(&mut self, map: &HashMap<Rid, Rid>) {
        if map.is_empty() {
            return;
        }
        for op in &mut self.operations {
            if let Some(r) = map.get(&op.record.rid) {
                op.record.rid = *r;
            }
        }
        for ch in self.index_changes.values_mut() {
            for ops in ch.keys.values_mut() {
                for o in ops.iter_mut() {
                    match o {
                        IndexKeyOp::Put(r) | IndexKeyOp::Remove(Some(r)) => {
                            if let Some(n) = map.get(r) {
                                *r = *n;
                            }
                        }
                        IndexKeyOp::Remove(None) => {}
                    }
                }
            }
        }
    }

    pub(crate) fn operations_mut(&mut self) -> &mut [RecordOperation] {
        &mut self.operations
    }

    pub(crate) fn into_operations(self) -> Vec<RecordOperation> {
        self.operations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_rids_are_remapped_everywhere() {
        let mut tx = Transaction::new(1);
        let a = tx.create(3, b"a".to_vec(), 1);
        let b = tx.create(3, b"b".to_vec(), 1);
        assert!(a.is_temporary() && b.is_temporary() && a != b);
        tx.index_put("by_name", b"a", a);
        tx.index_remove("by_name", b"old", Some(b));

        let map = HashMap::from([(a, Rid::new(3, 0)), (b, Rid::new(3, 1))]);
        tx.remap_rids(&map);
        assert_eq!(tx.operations()[0].record.rid, Rid::new(3, 0));
        let ch = &tx.index_changes()["by_name"];
        assert_eq!(ch.keys[b"a".as_slice()], vec![IndexKeyOp::Put(Rid::new(3, 0))]);
        assert_eq!(
            ch.keys[b"old".as_slice()],
            vec![IndexKeyOp::Remove(Some(Rid::new(3, 1)))]
        );
    }

    #[test]
    fn clear_drops_pending_key_changes() {
        let mut tx = Transaction::new(2);
        tx.index_put("i", b"k", Rid::new(1, 1));
        tx.index_clear("i");
        tx.index_put("i", b"z", Rid::new(1, 2));
        let ch = &tx.index_changes()["i"];
        assert!(ch.cleared);
        assert_eq!(ch.keys.len(), 1);
    }
}
