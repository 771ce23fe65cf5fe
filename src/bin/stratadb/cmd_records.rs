use anyhow::{anyhow, Result};
use std::path::PathBuf;

use StrataDB::{Rid, StorageEngine};

use crate::util::{decode_value_arg, display_bytes, open_engine};

fn resolve_cluster(engine: &StorageEngine, cluster: &str) -> Result<i32> {
    if let Ok(id) = cluster.trim_start_matches('#').parse::<i32>() {
        return Ok(id);
    }
    engine
        .cluster_id_by_name(cluster)
        .ok_or_else(|| anyhow!("cluster '{}' not found", cluster))
}

pub fn exec_add_cluster(path: PathBuf, name: String) -> Result<()> {
    let engine = open_engine(&path)?;
    let id = engine.add_cluster(&name)?;
    println!("cluster '{}' added as #{}", name, id);
    engine.close()?;
    Ok(())
}

pub fn exec_put(path: PathBuf, cluster: String, value: String) -> Result<()> {
    let content = decode_value_arg(&value)?;
    let engine = open_engine(&path)?;
    let cluster_id = resolve_cluster(&engine, &cluster)?;
    let (rid, version) = engine.create_record(cluster_id, &content, -1, b'b')?;
    println!("{} v{} ({} bytes)", rid, version, content.len());
    engine.close()?;
    Ok(())
}

pub fn exec_get(path: PathBuf, rid: String, out: Option<PathBuf>) -> Result<()> {
    let rid: Rid = rid.parse()?;
    let engine = open_engine(&path)?;
    let rec = engine.read_record(rid);
    engine.close()?;
    let rec = rec?;
    match out {
        Some(p) => {
            std::fs::write(&p, &rec.content)?;
            println!("{} v{}: {} bytes written to {}", rid, rec.version, rec.content.len(), p.display());
        }
        None => println!("{} v{}: {}", rid, rec.version, display_bytes(&rec.content)),
    }
    Ok(())
}

pub fn exec_del(path: PathBuf, rid: String, version: i32) -> Result<()> {
    let rid: Rid = rid.parse()?;
    let engine = open_engine(&path)?;
    let res = engine.delete_record(rid, version);
    engine.close()?;
    res?;
    println!("{} deleted", rid);
    Ok(())
}
