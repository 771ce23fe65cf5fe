//! engine/ddl — кластеры и индексные движки.
//!
//! Все операции здесь идут под write-локом состояния: ни один коммит не видит
//! наполовину созданный компонент. Файлы создаются/удаляются атомарной
//! операцией, storage.json переписывается после её коммита. Падение между
//! коммитом и записью реестра оставляет файлы-сироты; их убирает следующее
//! создание компонента с тем же именем.

use anyhow::Result;
use log::{info, warn};
use std::sync::Arc;

use super::StorageEngine;
use crate::atomic::OperationContext;
use crate::cache::PageCache;
use crate::consts::{CLUSTER_DATA_EXT, CLUSTER_MAP_EXT, HASH_INDEX_EXT};
use crate::error::{StorageError, StorageResult};
use crate::storage::{ClusterDef, HashIndex, IndexDef, PagedCluster};

fn validate_name(kind: &str, name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if !ok {
        return Err(StorageError::IllegalArgument(format!("invalid {} name '{}'", kind, name)).into());
    }
    Ok(())
}

impl StorageEngine {
    /// Удалить файлы, оставшиеся без записи в реестре.
    fn purge_orphan_files(&self, names: &[String]) -> Result<()> {
        let ids: Vec<u64> = names
            .iter()
            .filter_map(|n| self.cache.file_id_by_name(n))
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        warn!("purge_orphan_files: removing unregistered files {:?}", names);
        let mut ctx = OperationContext::new();
        self.atomic
            .execute_inside_atomic_operation(&mut ctx, None, |op| {
                for id in &ids {
                    op.delete_file(*id)?;
                }
                Ok(())
            })
    }

    /// Новый кластер; возвращает его id.
    pub fn add_cluster(&self, name: &str) -> StorageResult<i32> {
        self.guard("add_cluster", || {
            validate_name("cluster", name)?;
            let _state = self.state.write();
            let mut comps = self.write_components()?;
            if comps.registry.clusters.iter().any(|c| c.name == name) {
                return Err(StorageError::IllegalArgument(format!(
                    "cluster '{}' already exists",
                    name
                ))
                .into());
            }
            self.purge_orphan_files(&[
                format!("{}.{}", name, CLUSTER_MAP_EXT),
                format!("{}.{}", name, CLUSTER_DATA_EXT),
            ])?;

            let id = comps.registry.next_cluster_id;
            let mut ctx = OperationContext::new();
            let cluster = self
                .atomic
                .calculate_inside_atomic_operation(&mut ctx, None, |op| {
                    PagedCluster::create(op, id, name)
                })?;
            comps.registry.next_cluster_id = id + 1;
            comps.registry.clusters.push(ClusterDef {
                id,
                name: name.to_string(),
                map_file: cluster.map_file(),
                data_file: cluster.data_file(),
            });
            comps.registry.save(&self.root)?;
            comps.clusters.insert(id, cluster);
            info!("add_cluster: '{}' as #{}", name, id);
            Ok(id)
        })
    }

    pub fn drop_cluster(&self, cluster_id: i32) -> StorageResult<()> {
        self.guard("drop_cluster", || {
            let _state = self.state.write();
            let mut comps = self.write_components()?;
            let cluster = comps.cluster(cluster_id)?.clone();
            let mut ctx = OperationContext::new();
            self.atomic
                .execute_inside_atomic_operation(&mut ctx, None, |op| {
                    self.atomic
                        .acquire_exclusive_lock_till_operation_complete(op, &cluster.lock_key());
                    cluster.delete(op)
                })?;
            comps.registry.clusters.retain(|c| c.id != cluster_id);
            comps.registry.save(&self.root)?;
            comps.clusters.remove(&cluster_id);
            info!("drop_cluster: '{}' #{}", cluster.name(), cluster_id);
            Ok(())
        })
    }

    pub fn cluster_id_by_name(&self, name: &str) -> Option<i32> {
        let comps = self.components.read().ok()?;
        comps
            .clusters
            .values()
            .find(|c| c.name() == name)
            .map(|c| c.id())
    }

    pub fn cluster_names(&self) -> Vec<String> {
        match self.components.read() {
            Ok(comps) => comps.clusters.values().map(|c| c.name().to_string()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn add_index_engine(&self, name: &str, unique: bool) -> StorageResult<()> {
        self.guard("add_index_engine", || {
            validate_name("index", name)?;
            let _state = self.state.write();
            let mut comps = self.write_components()?;
            if comps.indexes.contains_key(name) {
                return Err(StorageError::IllegalArgument(format!(
                    "index engine '{}' already exists",
                    name
                ))
                .into());
            }
            self.purge_orphan_files(&[format!("{}.{}", name, HASH_INDEX_EXT)])?;

            let buckets = self.cfg.index_buckets;
            let mut ctx = OperationContext::new();
            let index = self
                .atomic
                .calculate_inside_atomic_operation(&mut ctx, None, |op| {
                    HashIndex::create(op, name, unique, buckets)
                })?;
            comps.registry.indexes.push(IndexDef {
                name: name.to_string(),
                unique,
                file_id: index.file_id(),
            });
            comps.registry.save(&self.root)?;
            info!(
                "add_index_engine: '{}' unique={} buckets={}",
                name,
                unique,
                index.buckets()
            );
            comps.indexes.insert(name.to_string(), Arc::new(index));
            Ok(())
        })
    }

    pub fn remove_index_engine(&self, name: &str) -> StorageResult<()> {
        self.guard("remove_index_engine", || {
            let _state = self.state.write();
            let mut comps = self.write_components()?;
            let index = comps.index(name)?.clone();
            let mut ctx = OperationContext::new();
            self.atomic
                .execute_inside_atomic_operation(&mut ctx, None, |op| {
                    self.atomic
                        .acquire_exclusive_lock_till_operation_complete(op, &index.lock_key());
                    index.delete(op)
                })?;
            comps.registry.indexes.retain(|d| d.name != name);
            comps.registry.save(&self.root)?;
            comps.indexes.remove(name);
            info!("remove_index_engine: '{}'", name);
            Ok(())
        })
    }

    pub fn index_names(&self) -> Vec<String> {
        match self.components.read() {
            Ok(comps) => comps.indexes.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}
