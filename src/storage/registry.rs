//! storage/registry — реестр компонентов хранилища `<root>/storage.json`.
//!
//! Хранит кластеры (id, имя, file id карты и данных), индексные движки и
//! instance id. Пишется атомарно (tmp+rename+fsync dir) после коммита DDL-операции.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::consts::STORAGE_REGISTRY_FILE;
use crate::util::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDef {
    pub id: i32,
    pub name: String,
    pub map_file: u64,
    pub data_file: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub unique: bool,
    pub file_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRegistry {
    pub instance_id: String,
    pub next_cluster_id: i32,
    #[serde(default)]
    pub clusters: Vec<ClusterDef>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

impl StorageRegistry {
    pub fn new(instance_id: String) -> Self {
        Self {
            instance_id,
            ..Default::default()
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(STORAGE_REGISTRY_FILE);
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(&root.join(STORAGE_REGISTRY_FILE), &bytes)
    }

    pub fn exists(root: &Path) -> bool {
        root.join(STORAGE_REGISTRY_FILE).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_save_load() -> Result<()> {
        let root = std::env::temp_dir().join(format!(
            "strata-registry-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        fs::create_dir_all(&root)?;
        let mut r = StorageRegistry::new("abc".into());
        r.next_cluster_id = 4;
        r.clusters.push(ClusterDef {
            id: 3,
            name: "users".into(),
            map_file: 1,
            data_file: 2,
        });
        r.indexes.push(IndexDef {
            name: "users_by_name".into(),
            unique: true,
            file_id: 5,
        });
        r.save(&root)?;
        assert_eq!(StorageRegistry::load(&root)?, r);
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }
}
