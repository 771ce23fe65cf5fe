use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;

use StrataDB::lock::{try_lock_dir, LockMode};
use StrataDB::meta::read_meta;
use StrataDB::storage::StorageRegistry;
use StrataDB::wal::{list_segments, segment_path, wal_dir};

/// Офлайн-статус: meta, реестр компонентов, сегменты WAL.
/// Хранилище не открывается и не восстанавливается.
pub fn exec(path: PathBuf, json_out: bool) -> Result<()> {
    let _lock = try_lock_dir(&path, LockMode::Shared)?;
    let meta = read_meta(&path)?;
    let registry = StorageRegistry::load(&path)?;
    let dir = wal_dir(&path);
    let mut segments = Vec::new();
    let mut wal_bytes = 0u64;
    for seg in list_segments(&dir)? {
        let len = std::fs::metadata(segment_path(&dir, seg))
            .map(|m| m.len())
            .unwrap_or(0);
        wal_bytes += len;
        segments.push((seg, len));
    }

    if json_out {
        let out = json!({
            "path": path.display().to_string(),
            "meta": {
                "version": meta.version,
                "page_size": meta.page_size,
                "dirty": meta.dirty,
                "non_tx_operations": meta.non_tx_operations,
                "instance_id": meta.instance_id_hex(),
                "created_at": meta.created_at,
            },
            "registry": registry,
            "wal": {
                "segments": segments.iter().map(|(s, l)| json!({"segment": s, "bytes": l})).collect::<Vec<_>>(),
                "total_bytes": wal_bytes,
            },
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Storage: {}", path.display());
    println!("Meta:");
    println!("  version:            {}", meta.version);
    println!("  page_size:          {}", meta.page_size);
    println!("  instance_id:        {}", meta.instance_id_hex());
    println!("  created_at:         {}", meta.created_at);
    println!(
        "  clean_shutdown:     {}",
        if meta.dirty { "NO (recovery on next open)" } else { "yes" }
    );
    println!("  non_tx_operations:  {}", meta.non_tx_operations);
    println!("Clusters: {}", registry.clusters.len());
    for c in &registry.clusters {
        println!(
            "  #{:<5} {:<24} map_file={} data_file={}",
            c.id, c.name, c.map_file, c.data_file
        );
    }
    println!("Indexes: {}", registry.indexes.len());
    for i in &registry.indexes {
        println!("  {:<30} unique={} file={}", i.name, i.unique, i.file_id);
    }
    println!("WAL: {} segment(s), {} bytes", segments.len(), wal_bytes);
    for (seg, len) in &segments {
        println!("  {:>10}  {} bytes", seg, len);
    }
    Ok(())
}
